//! reelforge CLI - run, resume and inspect story-video workflows.

use anyhow::{Context, Result};
use clap::Parser;
use reelforge::checkpoint::{CheckpointStore, StageJournal};
use reelforge::models::{ConfigError, StageId, WorkflowInput, WorkflowState, EXAMPLE_CONFIG};
use reelforge::{
    build_stages, Config, Orchestrator, Pipeline, ProgressBarReporter, ReelforgeError,
    ResumeIntent, ResumePlanner, RetryController, RetryPolicy, WorkflowStatus,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(version)]
#[command(about = "Checkpointed multi-stage pipeline for animated moral story videos")]
struct Cli {
    /// Input JSON with `context` and `preferences` (fresh runs only)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output directory for generated media (overrides the config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Workflow id; generated for fresh runs when omitted
    #[arg(long)]
    workflow_id: Option<String>,

    /// Resume the workflow from its latest checkpoint
    #[arg(long, conflicts_with_all = ["resume_from_step", "checkpoint_path"])]
    resume: bool,

    /// Resume from the checkpoint of STAGE, re-running that stage
    #[arg(long, value_name = "STAGE", conflicts_with = "checkpoint_path")]
    resume_from_step: Option<String>,

    /// Resume from an explicit checkpoint file
    #[arg(long, value_name = "FILE")]
    checkpoint_path: Option<PathBuf>,

    /// List checkpoints (of --workflow-id, or every workflow) and exit
    #[arg(long)]
    list_checkpoints: bool,

    /// Run in memory without writing checkpoints
    #[arg(long)]
    no_checkpoint: bool,

    /// Path to configuration file
    #[arg(short, long, default_value = "reelforge.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,
}

impl Cli {
    fn intent(&self) -> Result<ResumeIntent> {
        if let Some(path) = &self.checkpoint_path {
            return Ok(ResumeIntent::FromSnapshot(path.clone()));
        }
        if let Some(stage) = &self.resume_from_step {
            let stage: StageId = stage.parse()?;
            return Ok(ResumeIntent::FromStage(stage));
        }
        if self.resume {
            return Ok(ResumeIntent::Latest);
        }
        Ok(ResumeIntent::Fresh)
    }
}

/// Used when no `--input` is given.
const EXAMPLE_INPUT: &str = r#"{
  "context": {
    "theme": "honesty",
    "characters": [
      {"name": "Leo", "type": "animal", "traits": ["brave", "curious"]},
      {"name": "Mia", "type": "animal", "traits": ["wise", "kind"]}
    ],
    "setting": "magical forest",
    "moral_lesson": "Honesty is the best policy, even when it's hard",
    "age_group": "6-8",
    "duration_minutes": 3
  },
  "preferences": {"art_style": "cartoon", "narration": true, "music": true}
}"#;

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {e}");
    }
}

fn load_input(path: Option<&Path>) -> Result<WorkflowInput> {
    let doc: serde_json::Value = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file {}", path.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| ReelforgeError::InvalidInput(format!("{}: {e}", path.display())))?
        }
        None => {
            info!("No input file provided, using example input");
            serde_json::from_str(EXAMPLE_INPUT).context("Parsing built-in example input")?
        }
    };
    Ok(WorkflowInput::from_document(doc)?)
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.list_checkpoints && !cli.config.exists() {
        Config::default()
    } else {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    };
    if let Some(output) = &cli.output {
        config.output.dir = output.clone();
    }
    if cli.no_checkpoint {
        config.checkpoint.enabled = false;
    }
    Ok(config)
}

fn list_checkpoints(store: &CheckpointStore, workflow_id: Option<&str>) -> Result<()> {
    let Some(id) = workflow_id else {
        let workflows = store.workflows()?;
        if workflows.is_empty() {
            println!("No checkpoints under {}", store.root().display());
        }
        for id in workflows {
            println!("{id}  ({} checkpoints)", store.list(&id)?.len());
        }
        return Ok(());
    };

    let snapshots = store.list(id)?;
    if snapshots.is_empty() {
        return Err(ReelforgeError::CheckpointNotFound {
            workflow_id: id.to_string(),
            stage: None,
        }
        .into());
    }

    println!("Checkpoints for {id}:");
    for info in snapshots {
        println!(
            "  {:<20} {}  {:>8} B  {}",
            info.stage_name,
            info.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            info.size_bytes,
            info.path.display()
        );
    }
    Ok(())
}

fn print_summary(state: &WorkflowState) {
    println!("\n=== Workflow {} ===", state.status);
    println!("Workflow:    {}", state.workflow_id);
    println!("Progress:    {:.0}%", state.progress * 100.0);

    match state.status {
        WorkflowStatus::Completed => {
            let outputs = &state.stage_outputs;
            if let Some(video) = &outputs.video_assembler {
                println!("Video:       {}", video.final_video_path.display());
            }
            if let Some(words) = outputs
                .story_generator
                .as_ref()
                .and_then(|s| s.metadata.get("word_count"))
            {
                println!("Word count:  {words}");
            }
            if let Some(script) = &outputs.script_segmenter {
                println!("Duration:    {:.0}s", script.total_duration_secs());
            }
            if !state.errors.is_empty() {
                println!("Degraded:    {} error(s) recorded", state.errors.len());
            }
        }
        _ => {
            if let Some(last) = state.last_error() {
                println!("Failed at:   {}", last.stage);
                println!("Error:       {} ({})", last.message, last.error_type);
            }
            if state.errors.len() > 1 {
                println!("\nErrors encountered:");
                for err in &state.errors {
                    println!("  - {}: {}", err.stage, err.message);
                }
            }
            println!(
                "\nResume with: reelforge --resume --workflow-id {}",
                state.workflow_id
            );
        }
    }
}

async fn run(cli: &Cli) -> Result<WorkflowStatus> {
    let config = load_config(cli)?;

    let store = if config.checkpoint.enabled {
        Some(
            CheckpointStore::new(&config.checkpoint.dir, config.checkpoint.retention_count)
                .context("Failed to open checkpoint store")?,
        )
    } else {
        None
    };

    if cli.list_checkpoints {
        let store = store.as_ref().ok_or_else(|| {
            ReelforgeError::Resume("checkpointing is disabled, nothing to list".to_string())
        })?;
        list_checkpoints(store, cli.workflow_id.as_deref())?;
        return Ok(WorkflowStatus::Completed);
    }

    let intent = cli.intent()?;
    let pipeline = Pipeline::new(build_stages(&config)?)?;

    let input = match intent {
        ResumeIntent::Fresh => Some(load_input(cli.input.as_deref())?),
        _ => {
            if cli.input.is_some() {
                warn!("--input is ignored when resuming; the checkpoint's input is used");
            }
            None
        }
    };

    let plan = ResumePlanner::new(&pipeline, store.as_ref())
        .plan(&intent, cli.workflow_id.as_deref(), input)
        .context("Failed to plan the run")?;

    if let Some(store) = &store {
        let dir = store.workflow_dir(&plan.state.workflow_id)?;
        if let Some(lost) = StageJournal::recover(&dir)? {
            warn!(
                stage = %lost.stage,
                started_at = %lost.started_at,
                "Stage was interrupted by a crash and will run again"
            );
        }
    }

    let retry = RetryController::new(RetryPolicy::from(&config.retry));
    let mut orchestrator = Orchestrator::new(pipeline, retry)
        .with_artifacts(config.checkpoint.export_artifacts)
        .with_reporter(ProgressBarReporter::new());
    if let Some(store) = store {
        orchestrator = orchestrator.with_store(store);
    }

    info!(
        workflow_id = %plan.state.workflow_id,
        start_index = plan.start_index,
        "Running workflow"
    );
    let outcome = orchestrator.resume(plan).await?;
    print_summary(&outcome.state);
    Ok(outcome.status)
}

fn is_configuration(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ReelforgeError>()
            .is_some_and(ReelforgeError::is_configuration)
            || cause.downcast_ref::<ConfigError>().is_some()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if cli.example_config {
        println!("{EXAMPLE_CONFIG}");
        return ExitCode::SUCCESS;
    }

    match run(&cli).await {
        Ok(WorkflowStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            error!(%status, "Workflow did not complete");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e:#}");
            if is_configuration(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
