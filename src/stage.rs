//! The contract every pipeline stage implements.
//!
//! A stage reads the current state and returns a `StatePatch`, or a classified
//! `StageError`. It never mutates the state itself.

use crate::models::{StageError, StageId, StageOutput, StatePatch, WorkflowState};
use async_trait::async_trait;

/// Read-only view handed to a stage invocation.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub state: &'a WorkflowState,
    pub stage: StageId,
    /// 1-based attempt number within the current retry cycle
    pub attempt: u32,
    /// Set when this stage is the explicit target of a resume: its slot must
    /// be recomputed, never reused
    pub rerun: bool,
}

impl<'a> StageContext<'a> {
    pub fn new(state: &'a WorkflowState, stage: StageId, attempt: u32) -> Self {
        Self {
            state,
            stage,
            attempt,
            rerun: false,
        }
    }

    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    /// The stage's own slot, if a previous run already filled it.
    ///
    /// Stages may short-circuit on this when the state was seeded from a
    /// checkpoint taken after them. Always `None` for a rerun target.
    pub fn existing_output(&self) -> Option<StageOutput> {
        if !self.rerun && self.state.stage_outputs.is_populated(self.stage) {
            self.state.stage_outputs.get(self.stage)
        } else {
            None
        }
    }
}

/// A unit of work in the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which slot this stage fills.
    fn id(&self) -> StageId;

    /// Optional stages degrade gracefully: their failure never halts the run.
    fn optional(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StatePatch, StageError>;
}

/// Return the existing output unchanged, when there is one.
pub fn reuse_existing(ctx: &StageContext<'_>) -> Option<StatePatch> {
    ctx.existing_output().map(StatePatch::with_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Story, WorkflowInput};
    use serde_json::json;

    #[test]
    fn existing_output_reflects_own_slot_only() {
        let input = WorkflowInput::from_document(json!({"context": {}})).unwrap();
        let mut state = WorkflowState::new(None, input);
        state.apply(StatePatch::with_output(StageOutput::StoryGenerator(Story {
            text: "The fox returned the acorn.".into(),
            metadata: json!({}),
        })));

        let story_ctx = StageContext::new(&state, StageId::StoryGenerator, 1);
        let reused = reuse_existing(&story_ctx).expect("slot populated");
        assert_eq!(
            reused.output.map(|o| o.stage()),
            Some(StageId::StoryGenerator)
        );

        let script_ctx = StageContext::new(&state, StageId::ScriptSegmenter, 1);
        assert!(script_ctx.existing_output().is_none());
    }

    #[test]
    fn rerun_target_never_reuses_its_slot() {
        let input = WorkflowInput::from_document(json!({"context": {}})).unwrap();
        let mut state = WorkflowState::new(None, input);
        state.apply(StatePatch::with_output(StageOutput::StoryGenerator(Story {
            text: "The owl kept the secret.".into(),
            metadata: json!({}),
        })));

        let ctx = StageContext::new(&state, StageId::StoryGenerator, 1).with_rerun(true);
        assert!(ctx.existing_output().is_none());
        assert!(reuse_existing(&ctx).is_none());
    }
}
