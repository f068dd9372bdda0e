//! Stage executed as a child process.
//!
//! The request goes to stdin, the patch comes back on stdout. Exit codes
//! follow sysexits: 65 (`EX_DATAERR`) is a validation failure, 75
//! (`EX_TEMPFAIL`) a transient one. Anything else non-zero is fatal.

use super::{parse_patch, tail, StageRequest};
use crate::models::{
    expand_map, ConfigError, Result, StageConfig, StageError, StageId, StatePatch,
};
use crate::stage::{reuse_existing, Stage, StageContext};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const EXIT_DATAERR: i32 = 65;
pub const EXIT_TEMPFAIL: i32 = 75;

pub struct CommandStage {
    id: StageId,
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    optional: bool,
    skip_if_present: bool,
    output_root: PathBuf,
}

impl CommandStage {
    pub fn new(
        id: StageId,
        command: &[String],
        cfg: &StageConfig,
        output_root: &Path,
    ) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| ConfigError::InvalidStage {
            stage: id.to_string(),
            reason: "command is empty".to_string(),
        })?;

        Ok(Self {
            id,
            program: program.clone(),
            args: args.to_vec(),
            env: cfg.env.clone(),
            timeout: cfg.timeout(),
            optional: cfg.is_optional(id),
            skip_if_present: cfg.skip_if_present,
            output_root: output_root.to_path_buf(),
        })
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn execute(
        &self,
        payload: Vec<u8>,
        attempt: u32,
    ) -> std::result::Result<StatePatch, StageError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(expand_map(&self.env))
            .env("REELFORGE_STAGE", self.id.as_str())
            .env("REELFORGE_ATTEMPT", attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::resource(format!("spawning '{}'", self.program), e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            StageError::resource(
                "opening child stdin",
                std::io::Error::other("stdin was not captured"),
            )
        })?;
        let feed = async move {
            // Executors that ignore stdin close it early; that is not an error.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(error = %e, "Executor did not read the full request");
            }
        };

        let (_, output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|e| StageError::resource(format!("waiting for '{}'", self.program), e))?;

        match output.status.code() {
            Some(0) => parse_patch(&output.stdout),
            Some(EXIT_DATAERR) => Err(StageError::Validation(tail(&output.stderr))),
            Some(EXIT_TEMPFAIL) => Err(StageError::Provider(tail(&output.stderr))),
            _ => Err(StageError::Failed(format!(
                "'{}' {}: {}",
                self.program,
                output.status,
                tail(&output.stderr)
            ))),
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn optional(&self) -> bool {
        self.optional
    }

    async fn run(&self, ctx: &StageContext<'_>) -> std::result::Result<StatePatch, StageError> {
        if self.skip_if_present {
            if let Some(patch) = reuse_existing(ctx) {
                debug!(stage = %self.id, "Output already present, skipping executor");
                return Ok(patch);
            }
        }

        let payload = StageRequest::new(ctx, &self.output_root).to_json()?;
        debug!(
            stage = %self.id,
            program = %self.program,
            attempt = ctx.attempt,
            bytes = payload.len(),
            "Running stage command"
        );

        match tokio::time::timeout(self.timeout, self.execute(payload, ctx.attempt)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(self.timeout)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{StageOutput, Story, WorkflowInput, WorkflowState};
    use serde_json::json;

    fn state() -> WorkflowState {
        let input = WorkflowInput::from_document(json!({"context": {"theme": "friendship"}})).unwrap();
        WorkflowState::new(Some("wf-cmd".into()), input)
    }

    fn shell(script: &str) -> CommandStage {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        let cfg = StageConfig {
            timeout_secs: 30,
            ..StageConfig::default()
        };
        CommandStage::new(StageId::StoryGenerator, &command, &cfg, Path::new("out")).unwrap()
    }

    async fn run(
        stage: &CommandStage,
        state: &WorkflowState,
    ) -> std::result::Result<StatePatch, StageError> {
        stage.run(&StageContext::new(state, StageId::StoryGenerator, 1)).await
    }

    #[tokio::test]
    async fn reads_request_and_returns_patch() {
        let stage = shell(
            r#"grep -q '"stage":"story_generator"' && printf '%s' '{"output": {"stage": "story_generator", "text": "Two friends built a kite."}}'"#,
        );
        let patch = run(&stage, &state()).await.unwrap();
        assert_eq!(
            patch.output.map(|o| o.stage()),
            Some(StageId::StoryGenerator)
        );
    }

    #[tokio::test]
    async fn exit_codes_are_classified() {
        let s = state();
        let validation = run(&shell("echo 'theme missing' >&2; exit 65"), &s).await;
        assert!(matches!(validation, Err(StageError::Validation(ref m)) if m == "theme missing"));

        let transient = run(&shell("exit 75"), &s).await;
        assert!(matches!(transient, Err(StageError::Provider(_))));

        let fatal = run(&shell("exit 3"), &s).await;
        assert!(matches!(fatal, Err(StageError::Failed(_))));
    }

    #[tokio::test]
    async fn garbage_stdout_is_validation_error() {
        let result = run(&shell("cat >/dev/null; echo done"), &state()).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_program_is_resource_error() {
        let cfg = StageConfig {
            timeout_secs: 5,
            ..StageConfig::default()
        };
        let stage = CommandStage::new(
            StageId::StoryGenerator,
            &["/nonexistent/reelforge-stage".to_string()],
            &cfg,
            Path::new("out"),
        )
        .unwrap();
        let result = run(&stage, &state()).await;
        assert!(matches!(result, Err(StageError::Resource { .. })));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let stage = shell("sleep 5").with_timeout(Duration::from_millis(200));
        let result = run(&stage, &state()).await;
        assert!(matches!(result, Err(StageError::Timeout(_))));
    }

    #[tokio::test]
    async fn skip_if_present_reuses_slot() {
        let mut stage = shell("exit 3");
        stage.skip_if_present = true;
        let mut s = state();
        s.apply(StatePatch::with_output(StageOutput::StoryGenerator(Story {
            text: "Already written.".into(),
            metadata: json!({}),
        })));
        let patch = run(&stage, &s).await.unwrap();
        assert!(patch.output.is_some());
    }
}
