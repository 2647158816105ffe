//! memoria CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use memoria::{
    app::{App, WorkerMode},
    commands::{
        cmd_add_document, cmd_check, cmd_delete_document, cmd_duplicates, cmd_export, cmd_import,
        cmd_init, cmd_list_documents, cmd_list_failed, cmd_process, cmd_rebuild, cmd_reindex,
        cmd_retry, cmd_save, cmd_search, cmd_serve, cmd_show_document, cmd_status,
        cmd_update_document, print_consistency_report, print_document, print_documents,
        print_drain_report, print_duplicate_report, print_export_report, print_failed,
        print_import_report, print_init_report, print_rebuild_report, print_reindex_report,
        print_retry_report, print_save_report, print_search_response, print_status, InitOptions,
    },
    config::Config,
    error::{Error, Result},
    meta::{DocumentUpdate, NewDocument},
    progress::LogWriterFactory,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "memoria")]
#[command(version, about = "Local-first knowledge store with semantic search", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "MEMORIA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize memoria configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Add, edit and inspect documents
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Search documents
    Search {
        /// The search query
        query: String,

        /// Maximum number of results
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Find near-duplicates of a document or of free text
    Duplicates {
        /// Document ID to compare against
        id: Option<String>,

        /// Free text to compare against
        #[arg(long, conflicts_with = "id")]
        text: Option<String>,
    },

    /// Show system status
    Status,

    /// Embed everything pending, then exit
    Process {
        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Run embedding workers until interrupted
    Serve {
        /// Seconds between queue depth log lines
        #[arg(long, default_value = "60")]
        report_secs: u64,
    },

    /// Manage the embedding queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Manage the vector index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Re-embed every document, e.g. after changing the embedding model
    Reindex {
        /// Clear the index even if the model did not change
        #[arg(long)]
        force: bool,

        /// Embed the queued documents before returning
        #[arg(long)]
        wait: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DocAction {
    /// Add a document
    Add {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        body: String,

        #[arg(long, default_value = "notes")]
        category: String,

        #[arg(long)]
        section: Option<String>,
    },

    /// Change a document; omitted fields are kept
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        body: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        section: Option<String>,
    },

    /// Delete a document
    Delete { id: String },

    /// Show a document
    Show { id: String },

    /// List documents, newest first
    List {
        #[arg(long)]
        category: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Put failed documents back in the queue
    Retry {
        /// Only these document IDs (default: all failed)
        ids: Vec<String>,
    },

    /// List documents whose embedding failed
    Failed {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Rebuild the index from stored embeddings
    Rebuild,

    /// Write the index to disk now
    Save,

    /// Compare the index with the store
    Check,

    /// Copy the index files into a directory
    Export { dest: PathBuf },

    /// Install index files from a directory
    Import { src: PathBuf },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(LogWriterFactory::default()))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(LogWriterFactory::default()))
            .init();
    }
}

fn emit<T: Serialize>(json: bool, value: &T, print: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    // Init and completions run without an existing config
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force, cli.json).await;
    }
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "memoria", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let json = cli.json;

    // Reindex has to run before the index is opened
    if let Commands::Reindex { force, wait } = cli.command {
        let report = cmd_reindex(&config, force).await?;
        emit(json, &report, print_reindex_report)?;
        if wait {
            let app = App::open(config, WorkerMode::Enabled).await?;
            let drained = cmd_process(&app, !json).await;
            app.shutdown().await?;
            emit(json, &drained?, print_drain_report)?;
        }
        return Ok(());
    }

    let mode = match cli.command {
        Commands::Process { .. } | Commands::Serve { .. } => WorkerMode::Enabled,
        _ => WorkerMode::Disabled,
    };
    let app = App::open(config, mode).await?;
    let outcome = dispatch(&app, cli.command, json).await;
    let closed = app.shutdown().await;
    outcome.and(closed)
}

async fn dispatch(app: &App, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Init { .. } | Commands::Completions { .. } | Commands::Reindex { .. } => {
            Err(Error::Other("command handled before startup".to_string()))
        }

        Commands::Doc { action } => handle_doc(app, action, json).await,

        Commands::Search { query, k } => {
            let response = cmd_search(app, &query, k).await?;
            emit(json, &response, print_search_response)
        }

        Commands::Duplicates { id, text } => {
            let report = cmd_duplicates(app, id.as_deref(), text.as_deref()).await?;
            emit(json, &report, print_duplicate_report)
        }

        Commands::Status => {
            let status = cmd_status(app).await?;
            emit(json, &status, print_status)
        }

        Commands::Process { no_progress } => {
            let report = cmd_process(app, !no_progress && !json).await?;
            emit(json, &report, print_drain_report)
        }

        Commands::Serve { report_secs } => {
            cmd_serve(app, Duration::from_secs(report_secs.max(1))).await
        }

        Commands::Queue { action } => match action {
            QueueAction::Retry { ids } => {
                let ids = (!ids.is_empty()).then_some(ids);
                let report = cmd_retry(app, ids).await?;
                emit(json, &report, print_retry_report)
            }
            QueueAction::Failed { limit } => {
                let docs = cmd_list_failed(app, limit).await?;
                emit(json, &docs, |d| print_failed(d))
            }
        },

        Commands::Index { action } => match action {
            IndexAction::Rebuild => {
                let report = cmd_rebuild(app).await?;
                emit(json, &report, print_rebuild_report)
            }
            IndexAction::Save => {
                let report = cmd_save(app).await?;
                emit(json, &report, print_save_report)
            }
            IndexAction::Check => {
                let report = cmd_check(app).await?;
                emit(json, &report, print_consistency_report)
            }
            IndexAction::Export { dest } => {
                let report = cmd_export(app, &dest).await?;
                emit(json, &report, print_export_report)
            }
            IndexAction::Import { src } => {
                let report = cmd_import(app, &src).await?;
                emit(json, &report, print_import_report)
            }
        },
    }
}

async fn handle_doc(app: &App, action: DocAction, json: bool) -> Result<()> {
    match action {
        DocAction::Add {
            title,
            body,
            category,
            section,
        } => {
            let doc = cmd_add_document(
                app,
                NewDocument {
                    category,
                    section,
                    title,
                    body,
                },
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("✓ Added document {} (embedding pending)", doc.id);
            }
        }

        DocAction::Update {
            id,
            title,
            body,
            category,
            section,
        } => {
            let update = DocumentUpdate {
                category,
                section,
                title,
                body,
            };
            let doc = cmd_update_document(app, &id, update).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("✓ Document {} at revision {}", doc.id, doc.revision);
            }
        }

        DocAction::Delete { id } => {
            let report = cmd_delete_document(app, &id).await?;
            emit(json, &report, |r| println!("✓ Deleted document {}", r.id))?;
        }

        DocAction::Show { id } => {
            let doc = cmd_show_document(app, &id).await?;
            emit(json, &doc, print_document)?;
        }

        DocAction::List { category, limit } => {
            let docs = cmd_list_documents(app, category.as_deref(), limit).await?;
            emit(json, &docs, |d| print_documents(d))?;
        }
    }
    Ok(())
}

async fn handle_init(config: Option<PathBuf>, force: bool, json: bool) -> Result<()> {
    // A .toml path names the config file; anything else is the base directory
    let (base_dir, config_path) = match config {
        Some(path) if path.extension().is_some_and(|e| e == "toml") => {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base, path)
        }
        Some(dir) => (dir.clone(), dir.join("config.toml")),
        None => {
            let base = Config::default_base_dir();
            (base.clone(), base.join("config.toml"))
        }
    };

    let report = cmd_init(InitOptions {
        base_dir,
        config_path,
        force,
    })
    .await?;
    emit(json, &report, print_init_report)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        return Err(Error::NotInitialized);
    }

    Config::load(&config_path)
}
