//! End-to-end run scenarios with scripted providers and a stub dev server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use reify::config::{EngineConfig, RunSettings, SandboxSettings};
use reify::engine::Engine;
use reify::engine::providers::{
    CodeGenProvider, OverflowReport, PageProbe, Viewport, VisionScorer,
};
use reify::sandbox::PreviewStatus;
use reify::trace::{NodeStatus, RunOutcome, StreamFrame};

// ── Scripted providers ───────────────────────────────────────────────

/// Emits one file per call, versioned by call count.
struct ScriptedCodeGen {
    calls: AtomicUsize,
}

impl ScriptedCodeGen {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CodeGenProvider for ScriptedCodeGen {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "<files>\n<file path=\"src/app/page.tsx\">iteration {n}</file>\n</files>"
        ))
    }
}

/// Returns the scripted overall score for each successive call (all four
/// dimensions equal, so the weighted overall equals the scripted value).
struct ScriptedScorer {
    scores: Vec<f64>,
    calls: AtomicUsize,
}

impl ScriptedScorer {
    fn new(scores: &[f64]) -> Self {
        Self {
            scores: scores.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl VisionScorer for ScriptedScorer {
    async fn score(
        &self,
        _baseline_png: &Path,
        _candidate_png: &Path,
        _ir_summary: &str,
    ) -> Result<serde_json::Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let v = *self
            .scores
            .get(n)
            .or(self.scores.last())
            .expect("scorer script must not be empty");
        Ok(serde_json::json!({"layout": v, "style": v, "a11y": v, "perceptual": v}))
    }
}

/// Writes a tiny fake PNG; reports no overflow.
struct StubProbe;

#[async_trait]
impl PageProbe for StubProbe {
    async fn screenshot(&self, _url: &str, _viewport: Viewport, out_path: &Path) -> Result<u64> {
        let bytes: &[u8] = b"\x89PNG\r\n\x1a\nstub";
        tokio::fs::write(out_path, bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn overflow_scan(&self, _url: &str, _viewport: Viewport) -> Result<OverflowReport> {
        Ok(OverflowReport::default())
    }
}

// ── Fixture ──────────────────────────────────────────────────────────

struct Fixture {
    _tmp: tempfile::TempDir,
    storage: PathBuf,
    engine: Engine,
}

fn write_pack(storage: &Path, threshold: f64, max_iterations: u32) {
    let pack_dir = storage.join("projects/p1/artifacts/design-packs/pack1");
    std::fs::create_dir_all(pack_dir.join("baselines/home/desktop")).unwrap();
    std::fs::write(
        pack_dir.join("manifest.json"),
        serde_json::json!({
            "schemaVersion": "1.0",
            "projectName": "landing",
            "targets": [
                {"targetId": "home", "route": "/", "entry": {"type": "route"}}
            ],
            "breakpoints": [
                {"breakpointId": "desktop", "width": 1440, "height": 900}
            ],
            "states": [{"stateId": "default"}],
            "runDefaults": {
                "targetId": "home",
                "threshold": threshold,
                "maxIterations": max_iterations
            }
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        pack_dir.join("design-ir.json"),
        serde_json::json!({
            "schemaVersion": "1.0",
            "targets": [{
                "targetId": "home",
                "nodes": [{
                    "nodeId": "hero",
                    "name": "Hero",
                    "matchImportance": "critical",
                    "layoutTargets": {"bbox": {"x": 0, "y": 0, "w": 1440, "h": 480}},
                    "styleTargets": {"backgroundColor": "rgb(18,18,18)"}
                }]
            }]
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        pack_dir.join("baselines/home/desktop/default.png"),
        b"\x89PNG\r\n\x1a\nbaseline",
    )
    .unwrap();
}

fn fixture(threshold: f64, max_iterations: u32, scores: &[f64]) -> Fixture {
    fixture_with(threshold, max_iterations, scores, |_| {})
}

fn fixture_with(
    threshold: f64,
    max_iterations: u32,
    scores: &[f64],
    tune: impl FnOnce(&mut RunSettings),
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let storage = tmp.path().to_path_buf();

    let workspace = storage.join("projects/p1/workspace");
    std::fs::create_dir_all(workspace.join("node_modules")).unwrap();
    std::fs::write(workspace.join("package.json"), "{\"name\":\"app\"}").unwrap();
    write_pack(&storage, threshold, max_iterations);

    let mut run = RunSettings {
        warmup_timeout_secs: 0,
        settle_ms: 0,
        ..RunSettings::default()
    };
    tune(&mut run);

    let config = EngineConfig {
        storage_dir: storage.clone(),
        sandbox: SandboxSettings {
            install_cmd: vec!["true".into()],
            serve_cmd: vec!["sh".into(), "-c".into(), "echo 'Ready in 1ms'; sleep 60".into()],
            ready_timeout_secs: 10,
            ..SandboxSettings::default()
        },
        run,
        ..EngineConfig::default()
    };

    let engine = Engine::with_providers(
        config,
        Arc::new(ScriptedCodeGen::new()),
        Arc::new(ScriptedScorer::new(scores)),
        Arc::new(StubProbe),
    );
    Fixture {
        _tmp: tmp,
        storage,
        engine,
    }
}

impl Fixture {
    /// Start the run and pump the subscriber stream until `runFinished`.
    async fn run_to_completion(&self) -> (RunOutcome, Vec<StreamFrame>) {
        let (_buffered, mut rx) = self.engine.bus().subscribe("p1");
        self.engine.start_run("p1", "pack1").await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .expect("run did not finish in time")
                .expect("stream closed before runFinished");
            frames.push(frame.clone());
            if let StreamFrame::RunFinished { status, .. } = frame {
                return (status, frames);
            }
        }
    }

    fn root_message(&self) -> String {
        self.engine
            .bus()
            .tree("p1")
            .expect("trace tree exists")
            .message
            .expect("root carries a message")
    }

    fn workspace_page(&self) -> String {
        std::fs::read_to_string(
            self.storage
                .join("projects/p1/workspace/src/app/page.tsx"),
        )
        .unwrap()
    }

    async fn stop_previews(&self) {
        self.engine.sandbox().stop_all().await;
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

/// Threshold in one shot: first iteration clears the bar.
#[tokio::test]
async fn scenario_threshold_in_one_shot() {
    let fx = fixture(0.80, 5, &[0.85]);
    let (status, frames) = fx.run_to_completion().await;
    assert_eq!(status, RunOutcome::Success);
    assert_eq!(fx.root_message(), "threshold met");

    // Exactly one iteration happened and holds the best flag.
    assert_eq!(fx.engine.bus().best_iteration_index("p1"), Some(0));
    let tree = fx.engine.bus().tree("p1").unwrap();
    let iterations: Vec<_> = tree
        .children
        .iter()
        .filter(|c| c.step_key.as_deref() == Some("iteration"))
        .collect();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].status, NodeStatus::Success);
    assert_eq!(iterations[0].decision.as_deref(), Some("improved"));

    // Exactly one snapshot exists.
    let snapshots = fx.engine.snapshots().list("p1");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].iteration, 0);

    // runStarted came strictly before any event, runFinished last.
    assert!(matches!(frames[0], StreamFrame::RunStarted { .. }));
    assert!(matches!(frames[frames.len() - 1], StreamFrame::RunFinished { .. }));

    fx.stop_previews().await;
}

/// Steady improvement until the threshold is crossed at iteration 3.
#[tokio::test]
async fn scenario_steady_improvement() {
    let fx = fixture(0.85, 10, &[0.60, 0.70, 0.80, 0.90]);
    let (status, _frames) = fx.run_to_completion().await;
    assert_eq!(status, RunOutcome::Success);
    assert_eq!(fx.root_message(), "threshold met");
    assert_eq!(fx.engine.bus().best_iteration_index("p1"), Some(3));

    let tree = fx.engine.bus().tree("p1").unwrap();
    let iterations: Vec<_> = tree
        .children
        .iter()
        .filter(|c| c.step_key.as_deref() == Some("iteration"))
        .collect();
    assert_eq!(iterations.len(), 4);
    for node in &iterations {
        assert_eq!(node.decision.as_deref(), Some("improved"));
    }
    // The best flag sits on exactly one iteration.
    assert_eq!(iterations.iter().filter(|n| n.is_best).count(), 1);
    assert!(iterations[3].is_best);

    // A snapshot exists for every iteration that reached its screenshot.
    assert_eq!(fx.engine.snapshots().list("p1").len(), 4);

    fx.stop_previews().await;
}

/// A single regression is rejected and rolled back to the best snapshot.
#[tokio::test]
async fn scenario_single_regression_rolls_back() {
    let fx = fixture(0.99, 2, &[0.80, 0.60]);
    let (status, _frames) = fx.run_to_completion().await;
    assert_eq!(status, RunOutcome::Success);
    assert_eq!(fx.root_message(), "max_iterations");

    let tree = fx.engine.bus().tree("p1").unwrap();
    let iterations: Vec<_> = tree
        .children
        .iter()
        .filter(|c| c.step_key.as_deref() == Some("iteration"))
        .collect();
    assert_eq!(iterations[0].decision.as_deref(), Some("improved"));
    assert_eq!(iterations[1].decision.as_deref(), Some("regression"));
    assert_eq!(fx.engine.bus().best_iteration_index("p1"), Some(0));

    // The workspace was restored from iteration 0's snapshot.
    assert_eq!(fx.workspace_page(), "iteration 0");

    fx.stop_previews().await;
}

/// Three consecutive rejections stop the run.
#[tokio::test]
async fn scenario_regression_limit() {
    let fx = fixture(0.99, 10, &[0.80, 0.60, 0.60, 0.60]);
    let (status, _frames) = fx.run_to_completion().await;
    assert_eq!(status, RunOutcome::Success);
    assert_eq!(fx.root_message(), "regression_limit");
    assert_eq!(fx.engine.bus().best_iteration_index("p1"), Some(0));
    assert_eq!(fx.workspace_page(), "iteration 0");

    let tree = fx.engine.bus().tree("p1").unwrap();
    let iterations: Vec<_> = tree
        .children
        .iter()
        .filter(|c| c.step_key.as_deref() == Some("iteration"))
        .collect();
    assert_eq!(iterations.len(), 4);

    fx.stop_previews().await;
}

/// Accepted scores that stop moving trip the plateau detector.
#[tokio::test]
async fn scenario_plateau() {
    let fx = fixture_with(0.99, 10, &[0.60, 0.80, 0.82, 0.84], |run| {
        run.plateau_threshold = 0.05;
    });
    let (status, _frames) = fx.run_to_completion().await;
    assert_eq!(status, RunOutcome::Success);
    assert_eq!(fx.root_message(), "plateau");
    assert_eq!(fx.engine.bus().best_iteration_index("p1"), Some(3));

    let tree = fx.engine.bus().tree("p1").unwrap();
    let iterations: Vec<_> = tree
        .children
        .iter()
        .filter(|c| c.step_key.as_deref() == Some("iteration"))
        .collect();
    assert_eq!(iterations.len(), 4);
    for node in &iterations {
        assert_eq!(node.decision.as_deref(), Some("improved"));
    }

    fx.stop_previews().await;
}

/// Historical previews: starting a third evicts the least-recently-used.
#[cfg(unix)]
#[tokio::test]
async fn scenario_historical_lru_eviction() {
    let fx = fixture(0.99, 10, &[0.5]);
    let workspace = fx.storage.join("projects/p1/workspace");
    std::fs::create_dir_all(workspace.join("src")).unwrap();
    for iteration in 0..3u32 {
        std::fs::write(
            workspace.join("src/page.tsx"),
            format!("iteration {iteration}"),
        )
        .unwrap();
        fx.engine
            .snapshots()
            .create("p1", iteration, &workspace)
            .await
            .unwrap();
    }

    for iteration in 0..3u32 {
        fx.engine
            .start_historical_preview("p1", iteration)
            .await
            .unwrap();
        // Establish distinct last-accessed times for LRU ordering.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Capacity is 2: iteration 0 was evicted and its entry removed.
    assert_eq!(
        fx.engine.sandbox().historical_status("p1", 0).await.status,
        PreviewStatus::Stopped
    );

    for iteration in [1u32, 2] {
        let mut status = fx.engine.sandbox().historical_status("p1", iteration).await;
        for _ in 0..100 {
            if status.status == PreviewStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = fx.engine.sandbox().historical_status("p1", iteration).await;
        }
        assert_eq!(status.status, PreviewStatus::Ready);
    }

    fx.stop_previews().await;
}

/// Starting a second run stops its predecessor and takes the slot.
#[tokio::test]
async fn scenario_new_run_supersedes_predecessor() {
    let fx = fixture(0.99, 10, &[0.50, 0.51, 0.52, 0.53, 0.54]);
    let first = fx.engine.start_run("p1", "pack1").await.unwrap();
    let second = fx.engine.start_run("p1", "pack1").await.unwrap();
    assert_ne!(first, second);

    // The second run proceeds to its own runFinished. The superseded run may
    // also surface a cancelled runFinished; skip past it.
    let (_buffered, mut rx) = fx.engine.bus().subscribe("p1");
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("second run did not finish")
            .expect("stream closed");
        if let StreamFrame::RunFinished { run_id, .. } = frame
            && run_id == second
        {
            break;
        }
    }

    fx.stop_previews().await;
}

/// An empty code-gen response fails the iteration and the run.
#[tokio::test]
async fn scenario_empty_generation_fails_run() {
    struct EmptyCodeGen;
    #[async_trait]
    impl CodeGenProvider for EmptyCodeGen {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok("no files block at all".to_string())
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let storage = tmp.path().to_path_buf();
    let workspace = storage.join("projects/p1/workspace");
    std::fs::create_dir_all(workspace.join("node_modules")).unwrap();
    std::fs::write(workspace.join("package.json"), "{}").unwrap();
    write_pack(&storage, 0.9, 5);

    let config = EngineConfig {
        storage_dir: storage,
        ..EngineConfig::default()
    };
    let engine = Engine::with_providers(
        config,
        Arc::new(EmptyCodeGen),
        Arc::new(ScriptedScorer::new(&[0.5])),
        Arc::new(StubProbe),
    );

    let (_buffered, mut rx) = engine.bus().subscribe("p1");
    engine.start_run("p1", "pack1").await.unwrap();
    let status = loop {
        let frame = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("run did not finish")
            .expect("stream closed");
        if let StreamFrame::RunFinished { status, .. } = frame {
            break status;
        }
    };
    assert_eq!(status, RunOutcome::Error);

    let tree = engine.bus().tree("p1").unwrap();
    assert_eq!(tree.status, NodeStatus::Error);
    assert!(tree.message.unwrap().contains("no usable files"));
}
