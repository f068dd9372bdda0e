//! Configuration models for reelforge.
//!
//! Everything tunable lives here and is read from a TOML file. A missing
//! section falls back to the defaults below.

use crate::models::StageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level configuration for reelforge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Retry/backoff policy applied to every stage invocation
    #[serde(default)]
    pub retry: RetryConfig,

    /// Snapshot persistence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Where stages write their media
    #[serde(default)]
    pub output: OutputConfig,

    /// How each stage is executed, keyed by stage name
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageConfig>,
}

/// Retry and backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in seconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: f64,

    /// Upper bound for any single delay, in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: f64,

    /// Multiplier applied per retry
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

/// Longest single backoff the config accepts, in seconds (one day).
pub const MAX_BACKOFF_SECS: f64 = 86_400.0;

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> f64 {
    1.0
}

fn default_max_backoff() -> f64 {
    60.0
}

fn default_exponential_base() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            exponential_base: default_exponential_base(),
        }
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Write a snapshot after every stage
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root directory; each workflow gets its own subdirectory
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Snapshots kept per workflow (oldest deleted first)
    #[serde(default = "default_retention")]
    pub retention_count: usize,

    /// Also write each stage output as `NN_<stage>.json`
    #[serde(default = "default_true")]
    pub export_artifacts: bool,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("temp/checkpoints")
}

fn default_retention() -> usize {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_checkpoint_dir(),
            retention_count: default_retention(),
            export_artifacts: true,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory handed to stages for their artifacts
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

/// How one stage is executed.
///
/// Exactly one of `command` or `url` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Program and arguments; receives the request on stdin
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Endpoint that receives the request as a JSON POST
    #[serde(default)]
    pub url: Option<String>,

    /// Extra HTTP headers. Values can contain ${ENV_VAR}
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Extra environment for command stages. Values can contain ${ENV_VAR}
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,

    /// Failure degrades the run instead of halting it.
    /// Defaults to true for web_researcher only.
    #[serde(default)]
    pub optional: Option<bool>,

    /// Return the existing slot output unchanged if it is already populated
    #[serde(default)]
    pub skip_if_present: bool,
}

fn default_stage_timeout() -> u64 {
    600
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_optional(&self, stage: StageId) -> bool {
        self.optional.unwrap_or_else(|| stage.optional_by_default())
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Resolve ${VAR} references in directory settings.
    fn expand_paths(&mut self) {
        let expand = |p: &Path| PathBuf::from(expand_env_vars(&p.to_string_lossy()));
        self.checkpoint.dir = expand(&self.checkpoint.dir);
        self.output.dir = expand(&self.output.dir);
    }

    /// Check value ranges and stage definitions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.retry;
        let backoff_in_range = |secs: f64| (0.0..=MAX_BACKOFF_SECS).contains(&secs);
        if !backoff_in_range(retry.initial_backoff_secs) {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff_secs must be between 0 and {MAX_BACKOFF_SECS}"
            )));
        }
        if !backoff_in_range(retry.max_backoff_secs) {
            return Err(ConfigError::Invalid(format!(
                "retry.max_backoff_secs must be between 0 and {MAX_BACKOFF_SECS}"
            )));
        }
        if !(retry.exponential_base.is_finite() && retry.exponential_base >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.exponential_base must be >= 1.0".to_string(),
            ));
        }
        if self.checkpoint.retention_count == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.retention_count must be > 0".to_string(),
            ));
        }

        for (stage, cfg) in &self.stages {
            match (&cfg.command, &cfg.url) {
                (Some(cmd), None) if cmd.first().is_some_and(|p| !p.trim().is_empty()) => {}
                (None, Some(url)) if !url.trim().is_empty() => {}
                (Some(_), Some(_)) => {
                    return Err(ConfigError::InvalidStage {
                        stage: stage.to_string(),
                        reason: "set either command or url, not both".to_string(),
                    });
                }
                _ => {
                    return Err(ConfigError::InvalidStage {
                        stage: stage.to_string(),
                        reason: "a non-empty command or url is required".to_string(),
                    });
                }
            }
            if cfg.timeout_secs == 0 {
                return Err(ConfigError::InvalidStage {
                    stage: stage.to_string(),
                    reason: "timeout_secs must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stages the pipeline needs but the config does not define.
    pub fn missing_stages(&self) -> Vec<StageId> {
        StageId::ALL
            .into_iter()
            .filter(|id| !self.stages.contains_key(id))
            .collect()
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    static ENV_VAR: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid")
    });

    re.replace_all(s, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| cap[0].to_string())
    })
    .into_owned()
}

/// Expand environment variables in every value of a map.
pub fn expand_map(values: &HashMap<String, String>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("No executor configured for stages: {0}")]
    MissingStages(String),
}

/// Example configuration printed by `--example-config`.
pub const EXAMPLE_CONFIG: &str = r#"# reelforge configuration file

[retry]
max_retries = 3
initial_backoff_secs = 1.0
max_backoff_secs = 60.0
exponential_base = 2.0

[checkpoint]
enabled = true
dir = "temp/checkpoints"
retention_count = 10
export_artifacts = true

[output]
dir = "output"

# Each stage is either a command (request on stdin, patch on stdout)
# or an HTTP endpoint (request POSTed as JSON, patch in the body).
[stages.context_analyzer]
command = ["./agents/context_analyzer"]
timeout_secs = 120

[stages.web_researcher]
url = "http://localhost:8080/research"
headers = { Authorization = "Bearer ${SEARCH_API_KEY}" }
optional = true

[stages.story_generator]
command = ["./agents/story_generator"]

[stages.script_segmenter]
command = ["./agents/script_segmenter"]

[stages.character_designer]
command = ["./agents/character_designer"]
timeout_secs = 1800

[stages.video_assembler]
command = ["./agents/video_assembler"]
timeout_secs = 3600
skip_if_present = true
"#;
