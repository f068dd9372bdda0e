//! End-to-end runs of the full six-stage pipeline against a real checkpoint
//! directory, with scripted stages standing in for the executors.

use async_trait::async_trait;
use reelforge::models::{
    CharacterDesigns, ContextAnalysis, ResearchFindings, Script, ScriptSegment, StageOutput,
    Story, VideoAssembly, WorkflowInput,
};
use reelforge::models::StageConfig;
use reelforge::stage::reuse_existing;
use reelforge::{
    CheckpointStore, CommandStage, Orchestrator, Pipeline, ProgressEvent, ResumeIntent, ResumePlanner,
    RetryController, RetryPolicy, Stage, StageContext, StageError, StageId, StatePatch,
    WorkflowState, WorkflowStatus,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    /// Fatal failure
    Fail,
    /// Recoverable failure on every attempt
    Transient,
}

struct ScriptedStage {
    id: StageId,
    optional: bool,
    behaviour: Behaviour,
    tag: &'static str,
    /// Short-circuit on an already populated slot
    reuse: bool,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Stage for ScriptedStage {
    fn id(&self) -> StageId {
        self.id
    }

    fn optional(&self) -> bool {
        self.optional
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StatePatch, StageError> {
        if self.reuse {
            if let Some(patch) = reuse_existing(ctx) {
                return Ok(patch);
            }
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => Ok(StatePatch::with_output(output_for(self.id, self.tag))),
            Behaviour::Fail => Err(StageError::Failed(format!("{} exploded", self.id))),
            Behaviour::Transient => Err(StageError::Provider(format!("{} overloaded", self.id))),
        }
    }
}

/// A valid output for `id`, marked with `tag` so reruns are distinguishable.
fn output_for(id: StageId, tag: &str) -> StageOutput {
    match id {
        StageId::ContextAnalyzer => StageOutput::ContextAnalyzer(ContextAnalysis {
            validated_context: json!({"theme": "honesty", "tag": tag}),
            search_queries: vec!["honesty fables".into()],
        }),
        StageId::WebResearcher => StageOutput::WebResearcher(ResearchFindings {
            results: json!([{"title": "Aesop", "tag": tag}]),
            summary: format!("research {tag}"),
        }),
        StageId::StoryGenerator => StageOutput::StoryGenerator(Story {
            text: format!("Leo told the truth ({tag})."),
            metadata: json!({"word_count": 5}),
        }),
        StageId::ScriptSegmenter => StageOutput::ScriptSegmenter(Script {
            segments: vec![ScriptSegment {
                scene_number: 1,
                description: format!("forest clearing {tag}"),
                characters: vec!["Leo".into()],
                dialogue: None,
                narration: Some("Once upon a time".into()),
                duration_seconds: 12.5,
                setting: "magical forest".into(),
                emotions: vec!["calm".into()],
            }],
        }),
        StageId::CharacterDesigner => {
            let mut characters = BTreeMap::new();
            characters.insert("Leo".to_string(), json!({"species": "lion", "tag": tag}));
            StageOutput::CharacterDesigner(CharacterDesigns {
                characters,
                scene_images: vec![PathBuf::from("scene_01.png")],
            })
        }
        StageId::VideoAssembler => StageOutput::VideoAssembler(VideoAssembly {
            final_video_path: PathBuf::from(format!("final_{tag}.mp4")),
            video_segments: vec![],
            narration_audio: None,
            background_music: None,
        }),
    }
}

/// Builds a six-stage pipeline and counts calls per stage.
struct Harness {
    calls: Vec<Arc<AtomicU32>>,
}

impl Harness {
    /// `fail` lists stages that fail fatally; web research is optional.
    fn pipeline(tag: &'static str, fail: &[StageId]) -> (Pipeline, Harness) {
        let script: Vec<_> = fail.iter().map(|id| (*id, Behaviour::Fail)).collect();
        Self::scripted(tag, &script, false)
    }

    /// Stages not listed in `script` succeed.
    fn scripted(
        tag: &'static str,
        script: &[(StageId, Behaviour)],
        reuse: bool,
    ) -> (Pipeline, Harness) {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        let mut calls = Vec::new();
        for id in StageId::ALL {
            let counter = Arc::new(AtomicU32::new(0));
            calls.push(Arc::clone(&counter));
            let behaviour = script
                .iter()
                .find(|(stage, _)| *stage == id)
                .map_or(Behaviour::Succeed, |(_, b)| *b);
            stages.push(Box::new(ScriptedStage {
                id,
                optional: id.optional_by_default(),
                behaviour,
                tag,
                reuse,
                calls: counter,
            }));
        }
        (Pipeline::new(stages).unwrap(), Harness { calls })
    }

    fn calls(&self, id: StageId) -> u32 {
        self.calls[id.ordinal()].load(Ordering::SeqCst)
    }
}

fn seed(id: &str) -> WorkflowState {
    let input = WorkflowInput::from_document(json!({
        "context": {"theme": "honesty", "age_group": "6-8"},
        "preferences": {"art_style": "cartoon"}
    }))
    .unwrap();
    WorkflowState::new(Some(id.to_string()), input)
}

fn orchestrator(pipeline: Pipeline, store: &CheckpointStore) -> Orchestrator {
    Orchestrator::new(pipeline, RetryController::new(RetryPolicy::no_retries()))
        .with_store(store.clone())
}

fn slot_json(state: &WorkflowState, id: StageId) -> String {
    serde_json::to_string(&state.stage_outputs.get(id)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_halts_and_keeps_completed_checkpoints() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();
    let (pipeline, harness) = Harness::pipeline("v1", &[StageId::StoryGenerator]);

    let outcome = Orchestrator::new(pipeline, RetryController::new(RetryPolicy::default()))
        .with_store(store.clone())
        .run(seed("wf-fail"), 0)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.state.current_stage_index, 2);
    assert_eq!(outcome.state.errors.len(), 1);
    assert_eq!(outcome.state.errors[0].stage, "story_generator");
    assert_eq!(outcome.state.errors[0].retry_count, 0);
    // Retries are available but a fatal error never uses them.
    assert_eq!(harness.calls(StageId::StoryGenerator), 1);
    assert_eq!(harness.calls(StageId::ScriptSegmenter), 0);

    let listed: Vec<_> = store
        .list("wf-fail")
        .unwrap()
        .into_iter()
        .map(|info| info.stage_name)
        .collect();
    assert_eq!(listed, ["context_analyzer", "web_researcher"]);

    let latest = store.load_latest("wf-fail").unwrap();
    assert_eq!(latest.state.status, WorkflowStatus::Failed);
    assert_eq!(latest.state.current_stage_index, 2);
}

#[tokio::test]
async fn optional_stage_failure_degrades() {
    let (pipeline, harness) = Harness::pipeline("v1", &[StageId::WebResearcher]);
    let outcome = Orchestrator::new(pipeline, RetryController::new(RetryPolicy::no_retries()))
        .run(seed("wf-degraded"), 0)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.state.progress, 1.0);
    assert!(outcome.state.stage_outputs.web_researcher.is_none());
    assert!(outcome.state.stage_outputs.video_assembler.is_some());
    assert_eq!(outcome.state.errors.len(), 1);
    assert_eq!(outcome.state.errors[0].stage, "web_researcher");
    assert_eq!(harness.calls(StageId::VideoAssembler), 1);
}

#[tokio::test(start_paused = true)]
async fn optional_stage_exhausting_retries_degrades() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();
    let (pipeline, harness) =
        Harness::scripted("v1", &[(StageId::WebResearcher, Behaviour::Transient)], false);

    let outcome = Orchestrator::new(pipeline, RetryController::new(RetryPolicy::default()))
        .with_store(store.clone())
        .run(seed("wf-flaky"), 0)
        .await
        .unwrap();

    assert_eq!(harness.calls(StageId::WebResearcher), 4);
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.state.errors.len(), 1);
    let err = &outcome.state.errors[0];
    assert_eq!(err.stage, "web_researcher");
    assert_eq!(err.error_type, "TransientProviderError");
    assert_eq!(err.retry_count, 3);

    let degraded = store.load_by_stage("wf-flaky", "web_researcher").unwrap();
    assert_eq!(degraded.state.current_stage_index, 2);
    assert_eq!(degraded.state.status, WorkflowStatus::Running);
    assert!(degraded.state.stage_outputs.web_researcher.is_none());
    assert_eq!(harness.calls(StageId::StoryGenerator), 1);
}

#[tokio::test]
async fn resume_latest_continues_without_touching_earlier_slots() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();

    let (broken, _) = Harness::pipeline("v1", &[StageId::StoryGenerator]);
    let failed = orchestrator(broken, &store)
        .run(seed("wf-resume"), 0)
        .await
        .unwrap();
    assert_eq!(failed.status, WorkflowStatus::Failed);

    let (fixed, harness) = Harness::pipeline("v2", &[]);
    let plan = ResumePlanner::new(&fixed, Some(&store))
        .plan(&ResumeIntent::Latest, Some("wf-resume"), None)
        .unwrap();
    assert_eq!(plan.start_index, 2);

    let outcome = orchestrator(fixed, &store)
        .run(plan.state, plan.start_index)
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(harness.calls(StageId::ContextAnalyzer), 0);
    assert_eq!(harness.calls(StageId::WebResearcher), 0);
    assert_eq!(harness.calls(StageId::StoryGenerator), 1);

    for id in [StageId::ContextAnalyzer, StageId::WebResearcher] {
        assert_eq!(slot_json(&outcome.state, id), slot_json(&failed.state, id));
    }
    // The earlier failure stays in the history.
    assert_eq!(outcome.state.errors.len(), 1);
    assert_eq!(
        outcome.state.stage_outputs.video_assembler.unwrap().final_video_path,
        PathBuf::from("final_v2.mp4")
    );
}

#[tokio::test]
async fn resume_from_stage_reruns_that_stage() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();

    let (first, _) = Harness::pipeline("v1", &[]);
    let done = orchestrator(first, &store)
        .run(seed("wf-rerun"), 0)
        .await
        .unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);

    let (second, harness) = Harness::pipeline("v2", &[]);
    let plan = ResumePlanner::new(&second, Some(&store))
        .plan(
            &ResumeIntent::FromStage(StageId::ScriptSegmenter),
            Some("wf-rerun"),
            None,
        )
        .unwrap();
    assert_eq!(plan.start_index, 3);

    let outcome = orchestrator(second, &store).resume(plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(harness.calls(StageId::StoryGenerator), 0);
    assert_eq!(harness.calls(StageId::ScriptSegmenter), 1);

    let state = &outcome.state;
    assert_eq!(
        slot_json(state, StageId::StoryGenerator),
        slot_json(&done.state, StageId::StoryGenerator)
    );
    let script = state.stage_outputs.script_segmenter.as_ref().unwrap();
    assert_eq!(script.segments[0].description, "forest clearing v2");
}

#[tokio::test]
async fn resume_from_stage_reruns_a_stage_that_reuses_its_slot() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();

    let (first, _) = Harness::pipeline("v1", &[]);
    orchestrator(first, &store)
        .run(seed("wf-reuse"), 0)
        .await
        .unwrap();

    let (second, harness) = Harness::scripted("v2", &[], true);
    let plan = ResumePlanner::new(&second, Some(&store))
        .plan(
            &ResumeIntent::FromStage(StageId::StoryGenerator),
            Some("wf-reuse"),
            None,
        )
        .unwrap();

    let outcome = orchestrator(second, &store).resume(plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(harness.calls(StageId::StoryGenerator), 1);
    let story = outcome.state.stage_outputs.story_generator.unwrap();
    assert_eq!(story.text, "Leo told the truth (v2).");
    // Later stages still short-circuit on their populated slots.
    assert_eq!(harness.calls(StageId::ScriptSegmenter), 0);
    let script = outcome.state.stage_outputs.script_segmenter.unwrap();
    assert_eq!(script.segments[0].description, "forest clearing v1");
}

#[cfg(unix)]
#[tokio::test]
async fn resume_from_stage_reruns_a_skip_if_present_command() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(&dir.path().join("checkpoints"), 10).unwrap();

    let two_stages = |story: Box<dyn Stage>| {
        let analyzer: Box<dyn Stage> = Box::new(ScriptedStage {
            id: StageId::ContextAnalyzer,
            optional: false,
            behaviour: Behaviour::Succeed,
            tag: "v1",
            reuse: false,
            calls: Arc::new(AtomicU32::new(0)),
        });
        Pipeline::new(vec![analyzer, story]).unwrap()
    };
    let scripted_story: Box<dyn Stage> = Box::new(ScriptedStage {
        id: StageId::StoryGenerator,
        optional: false,
        behaviour: Behaviour::Succeed,
        tag: "v1",
        reuse: false,
        calls: Arc::new(AtomicU32::new(0)),
    });
    orchestrator(two_stages(scripted_story), &store)
        .run(seed("wf-cmd-rerun"), 0)
        .await
        .unwrap();

    let cfg = StageConfig {
        timeout_secs: 30,
        skip_if_present: true,
        ..StageConfig::default()
    };
    let script = r#"cat >/dev/null; printf '%s' '{"output": {"stage": "story_generator", "text": "v2 rerun"}}'"#;
    let command = ["sh".to_string(), "-c".to_string(), script.to_string()];
    let story: Box<dyn Stage> =
        Box::new(CommandStage::new(StageId::StoryGenerator, &command, &cfg, dir.path()).unwrap());
    let pipeline = two_stages(story);

    let plan = ResumePlanner::new(&pipeline, Some(&store))
        .plan(
            &ResumeIntent::FromStage(StageId::StoryGenerator),
            Some("wf-cmd-rerun"),
            None,
        )
        .unwrap();
    let outcome = orchestrator(pipeline, &store).resume(plan).await.unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    let story = outcome.state.stage_outputs.story_generator.unwrap();
    assert_eq!(story.text, "v2 rerun");
}

#[tokio::test]
async fn resume_of_a_finished_workflow_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();
    let (first, _) = Harness::pipeline("v1", &[]);
    orchestrator(first, &store)
        .run(seed("wf-done"), 0)
        .await
        .unwrap();

    let (again, harness) = Harness::pipeline("v2", &[]);
    let plan = ResumePlanner::new(&again, Some(&store))
        .plan(&ResumeIntent::Latest, Some("wf-done"), None)
        .unwrap();
    assert_eq!(plan.start_index, StageId::ALL.len());

    let outcome = orchestrator(again, &store)
        .run(plan.state, plan.start_index)
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert!(StageId::ALL.iter().all(|id| harness.calls(*id) == 0));
}

#[tokio::test]
async fn progress_is_monotonic_and_tracks_the_cursor() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let (pipeline, _) = Harness::pipeline("v1", &[StageId::WebResearcher]);

    Orchestrator::new(pipeline, RetryController::new(RetryPolicy::no_retries()))
        .with_reporter(move |event: &ProgressEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        })
        .run(seed("wf-progress"), 0)
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), StageId::ALL.len());
    for (i, event) in events.iter().enumerate() {
        let expected = (i + 1) as f64 / StageId::ALL.len() as f64;
        assert!((event.progress - expected).abs() < 1e-9);
        assert_eq!(event.stage_name, StageId::ALL[i].as_str());
    }
    assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
    // The degraded stage's error rides along with later events.
    assert_eq!(events[1].latest_errors.len(), 1);
    assert_eq!(events.last().unwrap().status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn panicking_reporter_does_not_abort_the_run() {
    let (pipeline, harness) = Harness::pipeline("v1", &[]);
    let outcome = Orchestrator::new(pipeline, RetryController::new(RetryPolicy::no_retries()))
        .with_reporter(|_event: &ProgressEvent| -> anyhow::Result<()> {
            panic!("terminal went away")
        })
        .run(seed("wf-panic"), 0)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(harness.calls(StageId::VideoAssembler), 1);
}

#[tokio::test]
async fn retention_keeps_the_newest_snapshots() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 3).unwrap();
    let (pipeline, _) = Harness::pipeline("v1", &[]);
    orchestrator(pipeline, &store)
        .run(seed("wf-retain"), 0)
        .await
        .unwrap();

    let listed: Vec<_> = store
        .list("wf-retain")
        .unwrap()
        .into_iter()
        .map(|info| info.stage_name)
        .collect();
    assert_eq!(
        listed,
        ["script_segmenter", "character_designer", "video_assembler"]
    );
    assert_eq!(
        store.load_latest("wf-retain").unwrap().state.status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn artifacts_are_numbered_by_position() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path(), 10).unwrap();
    let (pipeline, _) = Harness::pipeline("v1", &[]);
    orchestrator(pipeline, &store)
        .with_artifacts(true)
        .run(seed("wf-artifacts"), 0)
        .await
        .unwrap();

    let wf_dir = store.workflow_dir("wf-artifacts").unwrap();
    for (i, id) in StageId::ALL.iter().enumerate() {
        let path = wf_dir.join(format!("{:02}_{}.json", i + 1, id));
        let body = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["stage"], id.as_str());
    }
}
