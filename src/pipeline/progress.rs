//! Progress notifications emitted after every stage transition.

use crate::models::{ErrorRecord, StageId, WorkflowState, WorkflowStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, warn};

/// How many trailing error records travel with each event.
pub const EVENT_ERROR_WINDOW: usize = 3;

/// Snapshot of run progress handed to reporters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub stage_name: String,
    pub progress: f64,
    pub status: WorkflowStatus,
    pub latest_errors: Vec<ErrorRecord>,
}

impl ProgressEvent {
    pub fn new(stage: StageId, state: &WorkflowState) -> Self {
        Self {
            stage_name: stage.to_string(),
            progress: state.progress,
            status: state.status,
            latest_errors: state.latest_errors(EVENT_ERROR_WINDOW).to_vec(),
        }
    }
}

/// Receives progress events. Closures work too.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

impl<F> ProgressReporter for F
where
    F: Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Hand an event to `reporter`. Errors and panics are logged, never raised.
pub fn deliver(reporter: &dyn ProgressReporter, event: &ProgressEvent) {
    match panic::catch_unwind(AssertUnwindSafe(|| reporter.on_progress(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(stage = %event.stage_name, error = %e, "Progress callback failed"),
        Err(_) => error!(stage = %event.stage_name, "Progress callback panicked"),
    }
}

/// Terminal progress bar, in percent.
pub struct ProgressBarReporter {
    bar: ProgressBar,
}

impl ProgressBarReporter {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(100))
    }

    /// Wrap an existing bar (e.g. `ProgressBar::hidden()`).
    pub fn with_bar(bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn on_progress(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        self.bar.set_position((event.progress * 100.0).round() as u64);
        let mut message = format!("{} ({})", event.stage_name, event.status);
        if let Some(last) = event.latest_errors.last() {
            message.push_str(&format!(" last error: {} {}", last.stage, last.error_type));
        }

        if event.status.is_terminal() {
            self.bar.finish_with_message(message);
        } else {
            self.bar.set_message(message);
        }
        Ok(())
    }
}
