//! CLI commands implementation

pub mod documents;
pub mod index;
pub mod init;
pub mod queue;
pub mod reindex;
pub mod search;
pub mod serve;
pub mod status;

pub use documents::*;
pub use index::*;
pub use init::*;
pub use queue::*;
pub use reindex::*;
pub use search::*;
pub use serve::*;
pub use status::*;
