//! The fixed set of pipeline stages.

use crate::models::ReelforgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one stage (and of its output slot in the state record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    ContextAnalyzer,
    WebResearcher,
    StoryGenerator,
    ScriptSegmenter,
    CharacterDesigner,
    VideoAssembler,
}

impl StageId {
    /// All stages in canonical execution order.
    pub const ALL: [StageId; 6] = [
        StageId::ContextAnalyzer,
        StageId::WebResearcher,
        StageId::StoryGenerator,
        StageId::ScriptSegmenter,
        StageId::CharacterDesigner,
        StageId::VideoAssembler,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::ContextAnalyzer => "context_analyzer",
            StageId::WebResearcher => "web_researcher",
            StageId::StoryGenerator => "story_generator",
            StageId::ScriptSegmenter => "script_segmenter",
            StageId::CharacterDesigner => "character_designer",
            StageId::VideoAssembler => "video_assembler",
        }
    }

    /// Position in canonical order.
    pub fn ordinal(self) -> usize {
        match self {
            StageId::ContextAnalyzer => 0,
            StageId::WebResearcher => 1,
            StageId::StoryGenerator => 2,
            StageId::ScriptSegmenter => 3,
            StageId::CharacterDesigner => 4,
            StageId::VideoAssembler => 5,
        }
    }

    /// Research depends on an external search capability that may be absent,
    /// so its failure degrades the run instead of halting it.
    pub fn optional_by_default(self) -> bool {
        matches!(self, StageId::WebResearcher)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ReelforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ReelforgeError::UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for id in StageId::ALL {
            assert_eq!(id.as_str().parse::<StageId>().unwrap(), id);
            assert_eq!(StageId::ALL[id.ordinal()], id);
        }
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = "render_farm".parse::<StageId>().unwrap_err();
        assert!(matches!(err, ReelforgeError::UnknownStage(name) if name == "render_farm"));
    }

    #[test]
    fn only_research_is_optional() {
        let optional: Vec<_> = StageId::ALL
            .into_iter()
            .filter(|id| id.optional_by_default())
            .collect();
        assert_eq!(optional, vec![StageId::WebResearcher]);
    }
}
