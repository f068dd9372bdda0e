//! reelforge - Checkpointed, resumable multi-stage pipeline for story videos.
//!
//! ## Architecture
//!
//! A workflow is one state record threaded through six ordered stages:
//! context analysis → web research → story → script → character design →
//! video assembly. Each stage reads the state and returns a patch for its own
//! slot; the orchestrator merges it, advances the cursor and checkpoints.
//!
//! ## Pieces
//!
//! - **Stage contract** (`stage`): async trait, typed outputs, classified errors
//! - **Retry controller** (`retry`): exponential backoff on recoverable failures
//! - **Checkpoint store** (`checkpoint`): atomic per-workflow JSON snapshots
//! - **Orchestrator / resume planner** (`pipeline`): sequential execution and
//!   restart from the latest snapshot, a named stage or an explicit file
//! - **Adapters** (`client`): stages backed by a subprocess or an HTTP endpoint

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod stage;

// Re-exports for convenience
pub use checkpoint::{CheckpointStore, Snapshot, SnapshotInfo, StageJournal};
pub use client::{build_stages, CommandStage, HttpStage};
pub use models::{
    Config, ReelforgeError, Result, StageError, StageId, StatePatch, WorkflowState,
    WorkflowStatus,
};
pub use pipeline::{
    Orchestrator, Pipeline, ProgressBarReporter, ProgressEvent, ProgressReporter, ResumeIntent,
    ResumePlanner, RunOutcome,
};
pub use retry::{RetryController, RetryPolicy};
pub use stage::{Stage, StageContext};
