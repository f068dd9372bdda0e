//! Durable, per-workflow snapshots of the state record.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! <root>/<workflow_id>/
//!   checkpoint_<stage>_<timestamp>.json
//!   latest_checkpoint.json
//!   NN_<stage>.json
//! ```
//!
//! Every file is written to a hidden temp file, synced, then renamed into
//! place, so readers never observe a partial snapshot.

use crate::models::{ReelforgeError, Result, StageOutput, WorkflowState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current on-disk snapshot format.
pub const FORMAT_VERSION: u32 = 1;

/// Pointer file holding a copy of the newest snapshot.
pub const LATEST_FILE: &str = "latest_checkpoint.json";

const SNAPSHOT_PREFIX: &str = "checkpoint_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// A serialized state record plus the metadata it was saved under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub workflow_id: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    pub state: WorkflowState,
}

/// Snapshot metadata without the state body.
#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    format_version: u32,
    workflow_id: String,
    stage_name: String,
    timestamp: DateTime<Utc>,
}

/// Listing entry for one snapshot file.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub stage_name: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Filesystem-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    retention: usize,
}

impl CheckpointStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: &Path, retention: usize) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| ReelforgeError::io("creating checkpoint dir", e))?;
        Ok(Self {
            root: root.to_path_buf(),
            retention: retention.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Directory holding one workflow's files.
    pub fn workflow_dir(&self, workflow_id: &str) -> Result<PathBuf> {
        check_workflow_id(workflow_id)?;
        Ok(self.root.join(workflow_id))
    }

    /// Persist a snapshot tagged with `stage_name`, refresh the latest pointer
    /// and prune beyond retention.
    pub fn save(
        &self,
        workflow_id: &str,
        stage_name: &str,
        state: &WorkflowState,
    ) -> Result<SnapshotInfo> {
        let dir = self.ensure_workflow_dir(workflow_id)?;
        let (timestamp, path) = self.next_slot(workflow_id, &dir, stage_name)?;
        let body = encode(workflow_id, stage_name, timestamp, state)?;

        write_atomic(&path, &body)?;
        write_atomic(&dir.join(LATEST_FILE), &body)?;

        info!(
            workflow_id,
            stage = stage_name,
            path = %path.display(),
            "Checkpoint saved"
        );

        let pruned = self.prune(workflow_id)?;
        if pruned > 0 {
            debug!(workflow_id, pruned, "Pruned old checkpoints");
        }

        Ok(SnapshotInfo {
            stage_name: stage_name.to_string(),
            created_at: timestamp,
            path,
            size_bytes: body.len() as u64,
        })
    }

    /// Record the state of a failed run.
    ///
    /// Only the latest pointer is written: the listed snapshots keep showing
    /// the stages that actually completed.
    pub fn save_failure(
        &self,
        workflow_id: &str,
        stage_name: &str,
        state: &WorkflowState,
    ) -> Result<PathBuf> {
        let dir = self.ensure_workflow_dir(workflow_id)?;
        let timestamp = self.next_timestamp(workflow_id)?;
        let body = encode(workflow_id, stage_name, timestamp, state)?;
        let path = dir.join(LATEST_FILE);
        write_atomic(&path, &body)?;
        warn!(workflow_id, stage = stage_name, "Failure state saved");
        Ok(path)
    }

    /// Newest snapshot for a workflow.
    ///
    /// Falls back to the newest listed snapshot when the pointer is missing or
    /// unreadable.
    pub fn load_latest(&self, workflow_id: &str) -> Result<Snapshot> {
        let pointer = self.workflow_dir(workflow_id)?.join(LATEST_FILE);
        if pointer.exists() {
            match self.load_by_ref(&pointer) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => warn!(error = %e, "Latest pointer unreadable, falling back"),
            }
        }

        match self.list(workflow_id)?.pop() {
            Some(newest) => self.load_by_ref(&newest.path),
            None => Err(ReelforgeError::CheckpointNotFound {
                workflow_id: workflow_id.to_string(),
                stage: None,
            }),
        }
    }

    /// Newest snapshot tagged with `stage_name`.
    pub fn load_by_stage(&self, workflow_id: &str, stage_name: &str) -> Result<Snapshot> {
        let info = self.find_by_stage(workflow_id, stage_name)?;
        self.load_by_ref(&info.path)
    }

    /// Listing entry of the newest snapshot tagged with `stage_name`.
    pub fn find_by_stage(&self, workflow_id: &str, stage_name: &str) -> Result<SnapshotInfo> {
        self.list(workflow_id)?
            .into_iter()
            .rev()
            .find(|info| info.stage_name == stage_name)
            .ok_or_else(|| ReelforgeError::CheckpointNotFound {
                workflow_id: workflow_id.to_string(),
                stage: Some(stage_name.to_string()),
            })
    }

    /// Load an explicit snapshot file, wherever it lives.
    pub fn load_by_ref(&self, path: &Path) -> Result<Snapshot> {
        read_snapshot(path)
    }

    /// Snapshots for a workflow, oldest first. Unreadable files are skipped.
    pub fn list(&self, workflow_id: &str) -> Result<Vec<SnapshotInfo>> {
        let dir = self.workflow_dir(workflow_id)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/{}*.json",
            glob::Pattern::escape(&dir.to_string_lossy()),
            SNAPSHOT_PREFIX
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| ReelforgeError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok());

        let mut infos = Vec::new();
        for path in paths {
            match read_header(&path) {
                Ok((header, size_bytes)) => infos.push(SnapshotInfo {
                    stage_name: header.stage_name,
                    created_at: header.timestamp,
                    path,
                    size_bytes,
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }

        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(infos)
    }

    /// Workflow ids that have at least one snapshot, sorted.
    pub fn workflows(&self) -> Result<Vec<String>> {
        let entries =
            fs::read_dir(&self.root).map_err(|e| ReelforgeError::io("reading checkpoint dir", e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ReelforgeError::io("reading checkpoint dir", e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if check_workflow_id(&id).is_ok() && !self.list(&id)?.is_empty() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete the oldest snapshots beyond retention. Returns how many went.
    pub fn prune(&self, workflow_id: &str) -> Result<usize> {
        let snapshots = self.list(workflow_id)?;
        let excess = snapshots.len().saturating_sub(self.retention);
        for info in &snapshots[..excess] {
            fs::remove_file(&info.path)
                .map_err(|e| ReelforgeError::io(format!("removing {}", info.path.display()), e))?;
        }
        Ok(excess)
    }

    /// Export one stage output as a readable `NN_<stage>.json` file.
    pub fn write_artifact(
        &self,
        workflow_id: &str,
        position: usize,
        output: &StageOutput,
    ) -> Result<PathBuf> {
        let dir = self.ensure_workflow_dir(workflow_id)?;
        let path = dir.join(format!("{:02}_{}.json", position + 1, output.stage()));
        let mut body = serde_json::to_string_pretty(output)
            .map_err(|e| ReelforgeError::serialization("encoding stage artifact", e))?;
        body.push('\n');
        write_atomic(&path, &body)?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path)
    }

    fn ensure_workflow_dir(&self, workflow_id: &str) -> Result<PathBuf> {
        let dir = self.workflow_dir(workflow_id)?;
        fs::create_dir_all(&dir).map_err(|e| ReelforgeError::io("creating workflow dir", e))?;
        Ok(dir)
    }

    fn next_timestamp(&self, workflow_id: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        Ok(match self.list(workflow_id)?.last() {
            Some(newest) => now.max(newest.created_at + ChronoDuration::microseconds(1)),
            None => now,
        })
    }

    /// Pick a timestamp strictly after every existing snapshot, and a file
    /// name nobody has used.
    fn next_slot(
        &self,
        workflow_id: &str,
        dir: &Path,
        stage_name: &str,
    ) -> Result<(DateTime<Utc>, PathBuf)> {
        let mut timestamp = self.next_timestamp(workflow_id)?;

        loop {
            let path = dir.join(snapshot_file_name(stage_name, timestamp));
            if !path.exists() {
                return Ok((timestamp, path));
            }
            timestamp += ChronoDuration::microseconds(1);
        }
    }
}

/// `checkpoint_<stage>_<YYYYmmdd_HHMMSS_micros>.json`
fn snapshot_file_name(stage_name: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{SNAPSHOT_PREFIX}{stage_name}_{}.json",
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

fn check_workflow_id(workflow_id: &str) -> Result<()> {
    let valid = !workflow_id.is_empty()
        && workflow_id != "."
        && workflow_id != ".."
        && !workflow_id.contains(['/', '\\'])
        && !workflow_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ReelforgeError::InvalidInput(format!(
            "workflow id '{workflow_id}' cannot be used as a directory name"
        )))
    }
}

fn encode(
    workflow_id: &str,
    stage_name: &str,
    timestamp: DateTime<Utc>,
    state: &WorkflowState,
) -> Result<String> {
    let snapshot = Snapshot {
        format_version: FORMAT_VERSION,
        workflow_id: workflow_id.to_string(),
        stage_name: stage_name.to_string(),
        timestamp,
        state: state.clone(),
    };
    let mut body = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| ReelforgeError::serialization("encoding checkpoint", e))?;
    body.push('\n');
    Ok(body)
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let content = fs::read_to_string(path)
        .map_err(|e| ReelforgeError::io(format!("reading checkpoint {}", path.display()), e))?;
    let snapshot: Snapshot =
        serde_json::from_str(&content).map_err(|e| ReelforgeError::InvalidCheckpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    check_version(path, snapshot.format_version)?;
    if snapshot.workflow_id != snapshot.state.workflow_id {
        return Err(ReelforgeError::InvalidCheckpoint {
            path: path.to_path_buf(),
            reason: format!(
                "header workflow '{}' does not match state workflow '{}'",
                snapshot.workflow_id, snapshot.state.workflow_id
            ),
        });
    }
    Ok(snapshot)
}

fn read_header(path: &Path) -> Result<(SnapshotHeader, u64)> {
    let content = fs::read_to_string(path)
        .map_err(|e| ReelforgeError::io(format!("reading checkpoint {}", path.display()), e))?;
    let header: SnapshotHeader =
        serde_json::from_str(&content).map_err(|e| ReelforgeError::InvalidCheckpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    check_version(path, header.format_version)?;
    if header.workflow_id.is_empty() {
        return Err(ReelforgeError::InvalidCheckpoint {
            path: path.to_path_buf(),
            reason: "empty workflow id".to_string(),
        });
    }
    Ok((header, content.len() as u64))
}

fn check_version(path: &Path, version: u32) -> Result<()> {
    if version == 0 || version > FORMAT_VERSION {
        return Err(ReelforgeError::InvalidCheckpoint {
            path: path.to_path_buf(),
            reason: format!("unsupported format version {version}"),
        });
    }
    Ok(())
}

/// Write via a hidden temp file in the same directory, fsync, then rename.
/// Write `contents` through a hidden temp file, fsync, then rename over `path`.
pub(super) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        ReelforgeError::Internal(format!("path has no parent: {}", path.display()))
    })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReelforgeError::Internal(format!("bad file name: {}", path.display())))?;
    let tmp_path = parent.join(format!(".{file_name}.tmp"));

    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| ReelforgeError::io(format!("creating {}", tmp_path.display()), e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| ReelforgeError::io(format!("writing {}", tmp_path.display()), e))?;
        file.sync_all()
            .map_err(|e| ReelforgeError::io(format!("syncing {}", tmp_path.display()), e))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| ReelforgeError::io(format!("replacing {}", path.display()), e))?;
    Ok(())
}
