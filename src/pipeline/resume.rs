//! Turning a resume intent into a seed state and a start index.
//!
//! Every lookup failure is a configuration error. There is no silent
//! fallback to a fresh run.

use crate::checkpoint::{CheckpointStore, Snapshot, LATEST_FILE};
use crate::models::{ReelforgeError, Result, StageId, WorkflowInput, WorkflowState};
use crate::pipeline::Pipeline;
use std::path::PathBuf;
use tracing::info;

/// Where a run should start from.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeIntent {
    /// New state, first stage
    Fresh,
    /// Newest snapshot of the workflow, at its cursor
    Latest,
    /// Newest snapshot tagged with the stage; that stage runs again
    FromStage(StageId),
    /// An explicit snapshot file
    FromSnapshot(PathBuf),
}

/// Seed state plus the index of the first stage to execute.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub state: WorkflowState,
    pub start_index: usize,
    /// Snapshot the state came from, if any
    pub source: Option<PathBuf>,
    /// Stage that must execute again even though its slot is populated
    pub rerun: Option<StageId>,
}

pub struct ResumePlanner<'a> {
    pipeline: &'a Pipeline,
    store: Option<&'a CheckpointStore>,
}

impl<'a> ResumePlanner<'a> {
    pub fn new(pipeline: &'a Pipeline, store: Option<&'a CheckpointStore>) -> Self {
        Self { pipeline, store }
    }

    /// Resolve `intent`.
    ///
    /// `input` is only used for fresh runs; resumed runs keep the input stored
    /// in the snapshot.
    pub fn plan(
        &self,
        intent: &ResumeIntent,
        workflow_id: Option<&str>,
        input: Option<WorkflowInput>,
    ) -> Result<ResumePlan> {
        match intent {
            ResumeIntent::Fresh => {
                let input = input.ok_or_else(|| {
                    ReelforgeError::InvalidInput("a fresh run needs an input document".to_string())
                })?;
                let state = WorkflowState::new(workflow_id.map(str::to_string), input);
                info!(workflow_id = %state.workflow_id, "Starting fresh workflow");
                Ok(ResumePlan {
                    state,
                    start_index: 0,
                    source: None,
                    rerun: None,
                })
            }
            ResumeIntent::Latest => {
                let store = self.require_store()?;
                let id = require_workflow_id(workflow_id)?;
                let snapshot = store.load_latest(id)?;
                let source = store.workflow_dir(id)?.join(LATEST_FILE);
                let start_index = snapshot.state.current_stage_index;
                self.seed(snapshot, start_index, source, None)
            }
            ResumeIntent::FromStage(stage) => {
                let store = self.require_store()?;
                let id = require_workflow_id(workflow_id)?;
                let start_index = self.pipeline.position(*stage).ok_or_else(|| {
                    ReelforgeError::Resume(format!("stage {stage} is not part of this pipeline"))
                })?;
                let info = store.find_by_stage(id, stage.as_str())?;
                let snapshot = store.load_by_ref(&info.path)?;
                self.seed(snapshot, start_index, info.path, Some(*stage))
            }
            ResumeIntent::FromSnapshot(path) => {
                let store = self.require_store()?;
                let snapshot = store.load_by_ref(path)?;
                if let Some(id) = workflow_id {
                    if id != snapshot.workflow_id {
                        return Err(ReelforgeError::Resume(format!(
                            "snapshot belongs to workflow '{}', not '{id}'",
                            snapshot.workflow_id
                        )));
                    }
                }
                let start_index = snapshot.state.current_stage_index;
                self.seed(snapshot, start_index, path.clone(), None)
            }
        }
    }

    fn require_store(&self) -> Result<&'a CheckpointStore> {
        self.store.ok_or_else(|| {
            ReelforgeError::Resume("checkpointing is disabled, nothing to resume from".to_string())
        })
    }

    /// Validate a loaded snapshot and turn it into a plan starting at `start_index`.
    fn seed(
        &self,
        snapshot: Snapshot,
        start_index: usize,
        source: PathBuf,
        rerun: Option<StageId>,
    ) -> Result<ResumePlan> {
        let mut state = snapshot.state;
        let layout = self.pipeline.layout();

        state.current_stage_index = start_index;
        state
            .check_invariants(&layout)
            .map_err(|reason| ReelforgeError::InvalidCheckpoint {
                path: source.clone(),
                reason,
            })?;
        state.reset_for_resume();

        info!(
            workflow_id = %state.workflow_id,
            from_stage = %snapshot.stage_name,
            start_index,
            progress = state.progress,
            "Resuming workflow"
        );
        Ok(ResumePlan {
            state,
            start_index,
            source: Some(source),
            rerun,
        })
    }
}

fn require_workflow_id(workflow_id: Option<&str>) -> Result<&str> {
    workflow_id.ok_or_else(|| ReelforgeError::Resume("a workflow id is required to resume".to_string()))
}
