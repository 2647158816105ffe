//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub config_path: String,
    pub db_path: String,
    pub index_dir: String,
    pub overwritten: bool,
}

/// Write a default config and create the database
pub async fn cmd_init(options: InitOptions) -> Result<InitReport> {
    let InitOptions {
        base_dir,
        config_path,
        force,
    } = options;

    let overwritten = config_path.exists();
    if overwritten && !force {
        return Err(Error::Config(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let mut config = Config::default();
    config.init_paths(Some(base_dir));
    config.paths.config_file = config_path;
    config.validate()?;
    config.save()?;

    std::fs::create_dir_all(&config.paths.index_dir)?;
    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;
    db.close().await;
    info!("Created database at {:?}", config.paths.db_file);

    Ok(InitReport {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        index_dir: config.paths.index_dir.display().to_string(),
        overwritten,
    })
}

pub fn print_init_report(report: &InitReport) {
    println!("✓ memoria initialized successfully");
    if report.overwritten {
        println!("  (previous config overwritten)");
    }
    println!("  Config: {}", report.config_path);
    println!("  Database: {}", report.db_path);
    println!("  Index: {}", report.index_dir);
    println!("\nNext steps:");
    println!("  1. Point [embedding].url at your embedding backend");
    println!("  2. Add a note: memoria doc add --title \"...\" --body \"...\"");
    println!("  3. Start workers: memoria serve");
}
