//! Write-ahead journal for the stage currently executing.
//!
//! An `inflight.json` entry is written before a stage starts and removed once
//! its outcome is durable. Finding one at startup means the previous process
//! died mid-stage; the last checkpoint is still consistent, and the entry tells
//! the operator which stage was lost.

use super::store::write_atomic;
use crate::models::{ReelforgeError, Result, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const JOURNAL_FILE: &str = "inflight.json";

/// What was running when the journal entry was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflightStage {
    pub workflow_id: String,
    pub stage: StageId,
    pub stage_index: usize,
    pub started_at: DateTime<Utc>,
}

/// Journal entry for one stage execution.
pub struct StageJournal {
    path: PathBuf,
    entry: InflightStage,
    /// Whether the entry has been committed or aborted
    finished: bool,
}

impl StageJournal {
    /// Record that `stage` is about to run.
    pub fn begin(
        workflow_dir: &Path,
        workflow_id: &str,
        stage: StageId,
        stage_index: usize,
    ) -> Result<Self> {
        fs::create_dir_all(workflow_dir)
            .map_err(|e| ReelforgeError::io("creating workflow dir", e))?;

        let journal = Self {
            path: workflow_dir.join(JOURNAL_FILE),
            entry: InflightStage {
                workflow_id: workflow_id.to_string(),
                stage,
                stage_index,
                started_at: Utc::now(),
            },
            finished: false,
        };
        journal.persist()?;

        debug!(stage = %stage, stage_index, "Stage journal opened");
        Ok(journal)
    }

    /// Report and clear an entry left behind by a crashed run.
    pub fn recover(workflow_dir: &Path) -> Result<Option<InflightStage>> {
        let path = workflow_dir.join(JOURNAL_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| ReelforgeError::io("reading stage journal", e))?;
        let entry = match serde_json::from_str::<InflightStage>(&content) {
            Ok(entry) => {
                warn!(
                    workflow_id = %entry.workflow_id,
                    stage = %entry.stage,
                    started_at = %entry.started_at,
                    "Previous run was interrupted during a stage"
                );
                Some(entry)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable stage journal");
                None
            }
        };

        fs::remove_file(&path).map_err(|e| ReelforgeError::io("removing stage journal", e))?;
        Ok(entry)
    }

    /// The stage's outcome is durable; drop the entry.
    pub fn commit(mut self) -> Result<()> {
        self.clear()?;
        debug!(stage = %self.entry.stage, "Stage journal committed");
        Ok(())
    }

    /// The stage failed and the failure is recorded; drop the entry.
    pub fn abort(mut self) -> Result<()> {
        self.clear()?;
        debug!(stage = %self.entry.stage, "Stage journal aborted");
        Ok(())
    }

    pub fn entry(&self) -> &InflightStage {
        &self.entry
    }

    fn clear(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| ReelforgeError::io("removing stage journal", e))?;
        }
        self.finished = true;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entry)
            .map_err(|e| ReelforgeError::serialization("encoding stage journal", e))?;
        write_atomic(&self.path, &content)
    }
}

impl Drop for StageJournal {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                stage = %self.entry.stage,
                "Stage journal dropped without commit/abort - will be reported on restart"
            );
        }
    }
}
