//! Vector index: the flat ANN structure, its files, and the manager that
//! makes it safe to share.

pub mod files;
pub mod manager;
pub mod vector;

pub use files::{Bundle, IndexFiles};
pub use manager::{
    CommitOutcome, ConsistencyReport, IndexManager, IndexManagerOptions, IndexStatus,
    RebuildReport, RecoveryReport, RecoverySource,
};
pub use vector::{IndexError, IndexResult, Sidecar, SlotRecord, VectorIndex};
