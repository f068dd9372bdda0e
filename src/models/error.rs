//! Error types for reelforge.
//!
//! Two layers:
//! - `StageError`: what a stage invocation reports. Every variant carries an
//!   explicit `FailureKind`, which is all the retry controller looks at.
//! - `ReelforgeError`: everything else (configuration, checkpoints, IO).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Whether a stage failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; worth another attempt after a backoff.
    Recoverable,
    /// Retrying cannot help; fail the stage now.
    Fatal,
}

/// Classified failure returned by a stage.
#[derive(Debug, Error)]
pub enum StageError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL: input or environment is wrong, retrying cannot help
    // ═══════════════════════════════════════════════════════════════════

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource error: {context}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage failed: {0}")]
    Failed(String),

    // ═══════════════════════════════════════════════════════════════════
    // RECOVERABLE: provider hiccups, retried with backoff
    // ═══════════════════════════════════════════════════════════════════

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("provider error: {0}")]
    Provider(String),
}

impl StageError {
    /// Create a resource error with context.
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// Classification used by the retry controller.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Provider(_) => {
                FailureKind::Recoverable
            }
            Self::Validation(_) | Self::Resource { .. } | Self::Failed(_) => FailureKind::Fatal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Recoverable
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Stable name recorded in the state's error history.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Resource { .. } => "ResourceError",
            Self::Failed(_) => "StageFailed",
            Self::Timeout(_) => "Timeout",
            Self::RateLimited { .. } => "RateLimited",
            Self::Provider(_) => "TransientProviderError",
        }
    }
}

/// Top-level error type for reelforge.
#[derive(Debug, Error)]
pub enum ReelforgeError {
    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION: surfaced before any stage runs
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Unknown stage: '{0}'")]
    UnknownStage(String),

    #[error("No checkpoint found for workflow '{workflow_id}'{}", stage_suffix(.stage))]
    CheckpointNotFound {
        workflow_id: String,
        stage: Option<String>,
    },

    #[error("Invalid checkpoint {path}: {reason}")]
    InvalidCheckpoint { path: PathBuf, reason: String },

    #[error("Cannot resume: {0}")]
    Resume(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // RESOURCE: disk and serialization failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL: invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

fn stage_suffix(stage: &Option<String>) -> String {
    match stage {
        Some(stage) => format!(" at stage '{stage}'"),
        None => String::new(),
    }
}

impl ReelforgeError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error with context.
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Configuration problems are reported before any stage executes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownStage(_)
                | Self::CheckpointNotFound { .. }
                | Self::InvalidCheckpoint { .. }
                | Self::Resume(_)
                | Self::InvalidInput(_)
        )
    }
}

/// Result type alias for reelforge.
pub type Result<T> = std::result::Result<T, ReelforgeError>;
