//! Stage adapters: run a stage as a subprocess or as an HTTP call.
//!
//! Both adapters speak the same wire format. The request is a JSON
//! `StageRequest`; the reply is a JSON `StatePatch`.

mod command;
mod http;

pub use command::*;
pub use http::*;

use crate::models::{Config, ConfigError, Result, StageError, StageId, StatePatch, WorkflowState};
use crate::stage::{Stage, StageContext};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Payload handed to an external stage executor.
#[derive(Debug, Serialize)]
pub struct StageRequest<'a> {
    pub workflow_id: &'a str,
    pub stage: StageId,
    pub attempt: u32,
    /// Per-workflow directory for media the stage produces
    pub output_dir: PathBuf,
    pub state: &'a WorkflowState,
}

impl<'a> StageRequest<'a> {
    pub fn new(ctx: &StageContext<'a>, output_root: &Path) -> Self {
        Self {
            workflow_id: &ctx.state.workflow_id,
            stage: ctx.stage,
            attempt: ctx.attempt,
            output_dir: output_root.join(&ctx.state.workflow_id),
            state: ctx.state,
        }
    }

    pub fn to_json(&self) -> std::result::Result<Vec<u8>, StageError> {
        serde_json::to_vec(self)
            .map_err(|e| StageError::Failed(format!("encoding stage request: {e}")))
    }
}

/// Decode an executor reply. Anything unparsable is a validation failure.
pub fn parse_patch(body: &[u8]) -> std::result::Result<StatePatch, StageError> {
    let trimmed = String::from_utf8_lossy(body);
    if trimmed.trim().is_empty() {
        return Err(StageError::Validation("executor returned no output".to_string()));
    }
    serde_json::from_str(trimmed.trim())
        .map_err(|e| StageError::Validation(format!("executor output is not a patch: {e}")))
}

/// Build the full pipeline's stages from configuration, in canonical order.
pub fn build_stages(config: &Config) -> Result<Vec<Box<dyn Stage>>> {
    let missing = config.missing_stages();
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(|id| id.as_str()).collect();
        return Err(ConfigError::MissingStages(names.join(", ")).into());
    }

    let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(StageId::ALL.len());
    for id in StageId::ALL {
        let Some(cfg) = config.stages.get(&id) else {
            continue;
        };
        let stage: Box<dyn Stage> = match (&cfg.command, &cfg.url) {
            (Some(command), None) => {
                Box::new(CommandStage::new(id, command, cfg, &config.output.dir)?)
            }
            (None, Some(url)) => Box::new(HttpStage::new(id, url, cfg, &config.output.dir)?),
            _ => {
                return Err(ConfigError::InvalidStage {
                    stage: id.to_string(),
                    reason: "set exactly one of command or url".to_string(),
                }
                .into())
            }
        };
        stages.push(stage);
    }
    Ok(stages)
}

/// Last few hundred bytes of an executor's diagnostic output.
fn tail(bytes: &[u8]) -> String {
    const LIMIT: usize = 400;
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
