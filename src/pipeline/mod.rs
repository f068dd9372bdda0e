//! Pipeline module - orchestration, resume planning and progress reporting.

mod orchestrator;
pub mod progress;
mod resume;

pub use orchestrator::*;
pub use progress::{ProgressBarReporter, ProgressEvent, ProgressReporter};
pub use resume::*;
