//! Sequential, checkpointed stage execution.
//!
//! Pipeline flow, per stage:
//! journal → retry(stage) → merge patch → advance → checkpoint → artifact → report

use crate::checkpoint::{CheckpointStore, StageJournal};
use crate::models::{
    ReelforgeError, Result, StageError, StageId, StatePatch, WorkflowState, WorkflowStatus,
};
use crate::pipeline::progress::{deliver, ProgressEvent, ProgressReporter};
use crate::pipeline::ResumePlan;
use crate::retry::RetryController;
use crate::stage::{Stage, StageContext};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Ordered, validated list of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Stages must be unique and follow the canonical stage order.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        for pair in stages.windows(2) {
            let (prev, next) = (pair[0].id(), pair[1].id());
            if prev.ordinal() >= next.ordinal() {
                return Err(ReelforgeError::Internal(format!(
                    "stage {next} cannot follow {prev}"
                )));
            }
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    /// Position of `stage` in this pipeline.
    pub fn position(&self, stage: StageId) -> Option<usize> {
        self.stages.iter().position(|s| s.id() == stage)
    }

    /// `(stage, optional)` pairs, as `WorkflowState::check_invariants` wants them.
    pub fn layout(&self) -> Vec<(StageId, bool)> {
        self.stages.iter().map(|s| (s.id(), s.optional())).collect()
    }
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: WorkflowState,
    pub status: WorkflowStatus,
}

impl RunOutcome {
    fn new(state: WorkflowState) -> Self {
        Self {
            status: state.status,
            state,
        }
    }
}

/// Drives a seed state through the pipeline.
pub struct Orchestrator {
    pipeline: Pipeline,
    retry: RetryController,
    store: Option<CheckpointStore>,
    export_artifacts: bool,
    reporter: Option<Box<dyn ProgressReporter>>,
}

impl Orchestrator {
    /// In-memory orchestrator: no checkpoints, no reporter.
    pub fn new(pipeline: Pipeline, retry: RetryController) -> Self {
        Self {
            pipeline,
            retry,
            store: None,
            export_artifacts: false,
            reporter: None,
        }
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Also write each stage output as `NN_<stage>.json` (needs a store).
    pub fn with_artifacts(mut self, enabled: bool) -> Self {
        self.export_artifacts = enabled;
        self
    }

    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    /// Execute stages `start_index..` against `seed`.
    ///
    /// Stage failures are reported through the returned status and the
    /// state's error list; `Err` is reserved for bad arguments.
    pub async fn run(&self, seed: WorkflowState, start_index: usize) -> Result<RunOutcome> {
        self.execute(seed, start_index, None).await
    }

    /// Execute a resume plan. The plan's rerun target runs even if its slot
    /// is already populated.
    pub async fn resume(&self, plan: ResumePlan) -> Result<RunOutcome> {
        self.execute(plan.state, plan.start_index, plan.rerun).await
    }

    async fn execute(
        &self,
        seed: WorkflowState,
        start_index: usize,
        rerun: Option<StageId>,
    ) -> Result<RunOutcome> {
        let total = self.pipeline.len();
        if start_index > total {
            return Err(ReelforgeError::Resume(format!(
                "start index {start_index} is past the last stage ({total} stages)"
            )));
        }

        let mut state = seed;
        state.transition(WorkflowStatus::Running)?;
        state.current_stage_index = start_index;

        if start_index == total {
            state.transition(WorkflowStatus::Completed)?;
            info!(workflow_id = %state.workflow_id, "Nothing left to run");
            return Ok(RunOutcome::new(state));
        }

        let run_start = Instant::now();
        info!(
            workflow_id = %state.workflow_id,
            start_index,
            stages = total,
            rerun = rerun.map(StageId::as_str),
            checkpointing = self.store.is_some(),
            "Starting pipeline"
        );

        for (index, stage) in self.pipeline.stages.iter().enumerate().skip(start_index) {
            let id = stage.id();
            let optional = stage.optional();
            state.current_stage = Some(id);

            let journal = match self.open_journal(&state, id, index) {
                Ok(journal) => journal,
                Err(e) => {
                    state.record_error(id, &as_resource(id, "opening stage journal", &e), 0);
                    return Ok(self.fail(state, id, None));
                }
            };

            info!(stage = %id, index, optional, "Stage started");
            let stage_start = Instant::now();

            let current = &state;
            let forced = rerun == Some(id);
            let outcome = self
                .retry
                .run(id.as_str(), |attempt| async move {
                    let ctx = StageContext::new(current, id, attempt).with_rerun(forced);
                    let patch = stage.run(&ctx).await?;
                    patch.validate_for(id, optional)?;
                    Ok::<StatePatch, StageError>(patch)
                })
                .await;
            let retries = outcome.retries();

            let mut next = state.clone();
            match outcome.result {
                Ok(patch) => {
                    next.apply(patch);
                    info!(
                        stage = %id,
                        attempts = outcome.attempts,
                        elapsed_secs = stage_start.elapsed().as_secs_f64(),
                        "Stage completed"
                    );
                }
                Err(err) if optional => {
                    warn!(
                        stage = %id,
                        attempts = outcome.attempts,
                        error = %err,
                        "Optional stage failed, continuing without its output"
                    );
                    next.record_error(id, &err, retries);
                }
                Err(err) => {
                    error!(
                        stage = %id,
                        attempts = outcome.attempts,
                        error = %err,
                        "Stage failed"
                    );
                    state.record_error(id, &err, retries);
                    return Ok(self.fail(state, id, journal));
                }
            }

            next.advance(index, total);
            if index + 1 == total {
                next.transition(WorkflowStatus::Completed)?;
            }

            if let Err(e) = self.persist(&next, id, index) {
                error!(stage = %id, error = %e, "Checkpoint write failed");
                state.record_error(id, &as_resource(id, "writing checkpoint", &e), 0);
                return Ok(self.fail(state, id, journal));
            }

            state = next;
            if let Some(journal) = journal {
                if let Err(e) = journal.commit() {
                    warn!(stage = %id, error = %e, "Could not clear stage journal");
                }
            }
            self.notify(id, &state);
        }

        info!(
            workflow_id = %state.workflow_id,
            errors = state.errors.len(),
            runtime_secs = run_start.elapsed().as_secs_f64(),
            "Pipeline completed"
        );
        Ok(RunOutcome::new(state))
    }

    fn open_journal(
        &self,
        state: &WorkflowState,
        stage: StageId,
        index: usize,
    ) -> Result<Option<StageJournal>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let dir = store.workflow_dir(&state.workflow_id)?;
        StageJournal::begin(&dir, &state.workflow_id, stage, index).map(Some)
    }

    /// Checkpoint `state` after `stage`, then export its artifact.
    fn persist(&self, state: &WorkflowState, stage: StageId, index: usize) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(&state.workflow_id, stage.as_str(), state)?;

        if self.export_artifacts {
            if let Some(output) = state.stage_outputs.get(stage) {
                if let Err(e) = store.write_artifact(&state.workflow_id, index, &output) {
                    warn!(stage = %stage, error = %e, "Could not export stage artifact");
                }
            }
        }
        Ok(())
    }

    /// Mark the run failed, record it in the latest pointer, report it.
    fn fail(
        &self,
        mut state: WorkflowState,
        stage: StageId,
        journal: Option<StageJournal>,
    ) -> RunOutcome {
        if let Err(e) = state.transition(WorkflowStatus::Failed) {
            error!(error = %e, "Could not mark run failed");
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_failure(&state.workflow_id, stage.as_str(), &state) {
                error!(stage = %stage, error = %e, "Could not persist failure state");
            }
        }
        if let Some(journal) = journal {
            if let Err(e) = journal.abort() {
                warn!(stage = %stage, error = %e, "Could not clear stage journal");
            }
        }

        self.notify(stage, &state);
        warn!(
            workflow_id = %state.workflow_id,
            stage = %stage,
            cursor = state.current_stage_index,
            "Pipeline failed"
        );
        RunOutcome::new(state)
    }

    fn notify(&self, stage: StageId, state: &WorkflowState) {
        if let Some(reporter) = &self.reporter {
            debug!(stage = %stage, progress = state.progress, "Reporting progress");
            deliver(reporter.as_ref(), &ProgressEvent::new(stage, state));
        }
    }
}

fn as_resource(stage: StageId, what: &str, err: &ReelforgeError) -> StageError {
    StageError::resource(
        format!("{what} for {stage}"),
        std::io::Error::other(err.to_string()),
    )
}
