//! The state record threaded through the pipeline.
//!
//! Invariants:
//! - `progress` never decreases within a run.
//! - `errors` is append-only.
//! - `status` only moves pending → running → {completed, failed}.
//! - every non-optional slot before `current_stage_index` is populated.

use crate::models::{
    CharacterDesigns, ContextAnalysis, ReelforgeError, ResearchFindings, Result, Script,
    StageError, StageId, StageOutput, StatePatch, Story, VideoAssembly,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, no stage started yet
    Pending,
    /// Stages are executing
    Running,
    /// Every stage finished (possibly degraded)
    Completed,
    /// Halted on an unrecoverable stage failure
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn can_transition_to(self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable input supplied when the workflow is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub context: Value,
    #[serde(default = "empty_object")]
    pub preferences: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl WorkflowInput {
    /// Build input from a `{"context": {...}, "preferences": {...}}` document.
    pub fn from_document(doc: Value) -> Result<Self> {
        let Value::Object(mut map) = doc else {
            return Err(ReelforgeError::InvalidInput(
                "input must be a JSON object".to_string(),
            ));
        };

        let context = map
            .remove("context")
            .ok_or_else(|| ReelforgeError::InvalidInput("missing 'context' key".to_string()))?;
        if !context.is_object() {
            return Err(ReelforgeError::InvalidInput(
                "'context' must be an object".to_string(),
            ));
        }

        let preferences = match map.remove("preferences") {
            None | Some(Value::Null) => empty_object(),
            Some(prefs @ Value::Object(_)) => prefs,
            Some(_) => {
                return Err(ReelforgeError::InvalidInput(
                    "'preferences' must be an object".to_string(),
                ))
            }
        };

        Ok(Self {
            context,
            preferences,
        })
    }
}

/// One named slot per stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOutputs {
    pub context_analyzer: Option<ContextAnalysis>,
    pub web_researcher: Option<ResearchFindings>,
    pub story_generator: Option<Story>,
    pub script_segmenter: Option<Script>,
    pub character_designer: Option<CharacterDesigns>,
    pub video_assembler: Option<VideoAssembly>,
}

impl StageOutputs {
    /// Snapshot of one slot as a tagged output.
    pub fn get(&self, stage: StageId) -> Option<StageOutput> {
        match stage {
            StageId::ContextAnalyzer => self
                .context_analyzer
                .clone()
                .map(StageOutput::ContextAnalyzer),
            StageId::WebResearcher => self.web_researcher.clone().map(StageOutput::WebResearcher),
            StageId::StoryGenerator => self
                .story_generator
                .clone()
                .map(StageOutput::StoryGenerator),
            StageId::ScriptSegmenter => self
                .script_segmenter
                .clone()
                .map(StageOutput::ScriptSegmenter),
            StageId::CharacterDesigner => self
                .character_designer
                .clone()
                .map(StageOutput::CharacterDesigner),
            StageId::VideoAssembler => self
                .video_assembler
                .clone()
                .map(StageOutput::VideoAssembler),
        }
    }

    pub fn is_populated(&self, stage: StageId) -> bool {
        match stage {
            StageId::ContextAnalyzer => self.context_analyzer.is_some(),
            StageId::WebResearcher => self.web_researcher.is_some(),
            StageId::StoryGenerator => self.story_generator.is_some(),
            StageId::ScriptSegmenter => self
                .script_segmenter
                .as_ref()
                .is_some_and(|s| !s.segments.is_empty()),
            StageId::CharacterDesigner => self
                .character_designer
                .as_ref()
                .is_some_and(|c| !c.characters.is_empty()),
            StageId::VideoAssembler => self.video_assembler.is_some(),
        }
    }

    /// Overwrite the slot the output belongs to.
    pub fn set(&mut self, output: StageOutput) {
        match output {
            StageOutput::ContextAnalyzer(v) => self.context_analyzer = Some(v),
            StageOutput::WebResearcher(v) => self.web_researcher = Some(v),
            StageOutput::StoryGenerator(v) => self.story_generator = Some(v),
            StageOutput::ScriptSegmenter(v) => self.script_segmenter = Some(v),
            StageOutput::CharacterDesigner(v) => self.character_designer = Some(v),
            StageOutput::VideoAssembler(v) => self.video_assembler = Some(v),
        }
    }
}

/// Entry in the append-only error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: String,
    pub error_type: String,
    pub message: String,
    /// Retries performed before giving up (0 when the first attempt was fatal)
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// State record for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub input: WorkflowInput,
    #[serde(default)]
    pub stage_outputs: StageOutputs,
    #[serde(default)]
    pub quality_checks: BTreeMap<String, bool>,
    pub progress: f64,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub current_stage_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageId>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create an empty state. A random id is assigned when none is given.
    pub fn new(workflow_id: Option<String>, input: WorkflowInput) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            input,
            stage_outputs: StageOutputs::default(),
            quality_checks: BTreeMap::new(),
            progress: 0.0,
            status: WorkflowStatus::Pending,
            errors: Vec::new(),
            current_stage_index: 0,
            current_stage: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions out of a terminal state.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ReelforgeError::Internal(format!(
                "illegal status transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Merge a stage patch: present fields overwrite, absent fields stay.
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(output) = patch.output {
            self.stage_outputs.set(output);
        }
        self.quality_checks.extend(patch.quality_checks);
        self.updated_at = Utc::now();
    }

    /// Advance the cursor past the stage at `completed_index`.
    pub fn advance(&mut self, completed_index: usize, stage_count: usize) {
        self.current_stage_index = completed_index + 1;
        let fraction = if stage_count == 0 {
            1.0
        } else {
            (completed_index + 1) as f64 / stage_count as f64
        };
        self.progress = self.progress.max(fraction.min(1.0));
        self.updated_at = Utc::now();
    }

    /// Append an error record for `stage`.
    pub fn record_error(&mut self, stage: StageId, error: &StageError, retry_count: u32) {
        self.errors.push(ErrorRecord {
            stage: stage.to_string(),
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            retry_count,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }

    /// Most recent `n` errors, oldest first.
    pub fn latest_errors(&self, n: usize) -> &[ErrorRecord] {
        let start = self.errors.len().saturating_sub(n);
        &self.errors[start..]
    }

    /// Prepare a loaded snapshot to seed a new run.
    ///
    /// History (errors, progress, outputs) carries over; the status restarts.
    pub fn reset_for_resume(&mut self) {
        self.status = WorkflowStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Check the slot invariant against an ordered `(stage, optional)` list.
    pub fn check_invariants(&self, stages: &[(StageId, bool)]) -> std::result::Result<(), String> {
        if self.current_stage_index > stages.len() {
            return Err(format!(
                "cursor {} is past the last stage ({})",
                self.current_stage_index,
                stages.len()
            ));
        }
        if !(0.0..=1.0).contains(&self.progress) {
            return Err(format!("progress {} outside [0, 1]", self.progress));
        }
        for (stage, optional) in &stages[..self.current_stage_index] {
            if !optional && !self.stage_outputs.is_populated(*stage) {
                return Err(format!("stage {stage} completed but its slot is empty"));
            }
        }
        Ok(())
    }
}
