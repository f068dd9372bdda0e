//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `CheckpointStore`: per-workflow snapshots, the latest pointer, retention
//! - `StageJournal`: write-ahead marker for the stage currently running

mod journal;
mod store;

pub use journal::*;
pub use store::*;
