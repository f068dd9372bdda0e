//! Typed stage outputs and the patch a stage returns.
//!
//! Each stage owns exactly one slot in the state record. Outputs are checked
//! here, at the stage boundary, so downstream stages never have to probe for
//! missing fields.

use crate::models::{StageError, StageId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Validated context plus the search queries derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAnalysis {
    pub validated_context: Value,
    #[serde(default)]
    pub search_queries: Vec<String>,
}

/// Curated research results. May legitimately be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchFindings {
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub summary: String,
}

/// Complete story text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub text: String,
    /// Word count, themes, reading time, ...
    #[serde(default)]
    pub metadata: Value,
}

/// One scene of the segmented script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub scene_number: u32,
    pub description: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub emotions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub segments: Vec<ScriptSegment>,
}

impl Script {
    pub fn total_duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_seconds).sum()
    }
}

/// Character reference sheets and the rendered scene images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDesigns {
    pub characters: BTreeMap<String, Value>,
    #[serde(default)]
    pub scene_images: Vec<PathBuf>,
}

/// Final assembled video and its intermediate media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAssembly {
    pub final_video_path: PathBuf,
    #[serde(default)]
    pub video_segments: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration_audio: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_music: Option<PathBuf>,
}

/// Output of one stage, tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    ContextAnalyzer(ContextAnalysis),
    WebResearcher(ResearchFindings),
    StoryGenerator(Story),
    ScriptSegmenter(Script),
    CharacterDesigner(CharacterDesigns),
    VideoAssembler(VideoAssembly),
}

impl StageOutput {
    /// Slot this output belongs in.
    pub fn stage(&self) -> StageId {
        match self {
            StageOutput::ContextAnalyzer(_) => StageId::ContextAnalyzer,
            StageOutput::WebResearcher(_) => StageId::WebResearcher,
            StageOutput::StoryGenerator(_) => StageId::StoryGenerator,
            StageOutput::ScriptSegmenter(_) => StageId::ScriptSegmenter,
            StageOutput::CharacterDesigner(_) => StageId::CharacterDesigner,
            StageOutput::VideoAssembler(_) => StageId::VideoAssembler,
        }
    }

    /// Check the structural guarantees downstream stages rely on.
    pub fn validate(&self) -> Result<(), StageError> {
        match self {
            StageOutput::ContextAnalyzer(ctx) => {
                if !ctx.validated_context.is_object() {
                    return Err(StageError::Validation(
                        "validated_context must be a JSON object".to_string(),
                    ));
                }
            }
            StageOutput::WebResearcher(_) => {}
            StageOutput::StoryGenerator(story) => {
                if story.text.trim().is_empty() {
                    return Err(StageError::Validation("story text is empty".to_string()));
                }
            }
            StageOutput::ScriptSegmenter(script) => {
                if script.segments.is_empty() {
                    return Err(StageError::Validation(
                        "script has no segments".to_string(),
                    ));
                }
                if let Some(bad) = script
                    .segments
                    .iter()
                    .find(|s| !s.duration_seconds.is_finite() || s.duration_seconds <= 0.0)
                {
                    return Err(StageError::Validation(format!(
                        "scene {} has invalid duration {}",
                        bad.scene_number, bad.duration_seconds
                    )));
                }
            }
            StageOutput::CharacterDesigner(designs) => {
                if designs.characters.is_empty() {
                    return Err(StageError::Validation(
                        "no character designs produced".to_string(),
                    ));
                }
            }
            StageOutput::VideoAssembler(video) => {
                if video.final_video_path.as_os_str().is_empty() {
                    return Err(StageError::Validation(
                        "final_video_path is empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Partial update returned by a stage.
///
/// Fields present in the patch overwrite the same-named fields of the state;
/// anything absent is left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quality_checks: BTreeMap<String, bool>,
}

impl StatePatch {
    /// A patch that changes nothing (used for degraded optional stages).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: StageOutput) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn quality_check(mut self, name: impl Into<String>, passed: bool) -> Self {
        self.quality_checks.insert(name.into(), passed);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_none() && self.quality_checks.is_empty()
    }

    /// Enforce the stage contract for a patch produced by `stage`.
    pub fn validate_for(&self, stage: StageId, optional: bool) -> Result<(), StageError> {
        match &self.output {
            Some(output) if output.stage() != stage => Err(StageError::Validation(format!(
                "stage {stage} returned output for slot {}",
                output.stage()
            ))),
            Some(output) => output.validate(),
            None if optional => Ok(()),
            None => Err(StageError::Validation(format!(
                "stage {stage} returned no output"
            ))),
        }
    }
}
