//! The per-run state machine.
//!
//! One orchestrator instance drives one run: for each iteration it generates
//! code, brings the preview up, captures screenshots, scans for overflow,
//! scores against baselines, and lets the decision logic accept, reject, or
//! end the run. Every step emits trace events; every suspension point checks
//! the stop signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::RunSettings;
use crate::engine::codegen;
use crate::engine::locks::LockManager;
use crate::engine::plan::{PatchPlan, PatchPlanner};
use crate::engine::providers::{
    CodeGenProvider, OverflowOffender, PageProbe, Viewport, VisionScorer,
};
use crate::engine::score::{ScoreVector, Scorekeeper, parse_score_response};
use crate::engine::stop::{StopController, StopInputs};
use crate::errors::RunError;
use crate::pack::DesignPack;
use crate::paths::ProjectPaths;
use crate::sandbox::{PreviewStatus, SandboxManager};
use crate::snapshot::SnapshotStore;
use crate::trace::{AgentEvent, Artifact, EventPayload, EventType, ROOT_NODE_ID, RunOutcome, TraceBus};

const PREVIEW_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WARMUP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OVERFLOW_PROMPT_LIMIT: usize = 10;

/// Everything a run needs, wired up by the engine front-end.
pub struct RunOrchestrator {
    pub(crate) run_id: String,
    pub(crate) project_id: String,
    pub(crate) pack: DesignPack,
    pub(crate) paths: ProjectPaths,
    pub(crate) settings: RunSettings,
    pub(crate) sandbox: SandboxManager,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) bus: TraceBus,
    pub(crate) codegen: Arc<dyn CodeGenProvider>,
    pub(crate) scorer: Arc<dyn VisionScorer>,
    pub(crate) probe: Arc<dyn PageProbe>,
    pub(crate) stop_rx: watch::Receiver<bool>,
    pub(crate) http: reqwest::Client,
}

/// Mutable state across iterations.
struct RunState {
    iteration: u32,
    previous_score: Option<ScoreVector>,
    consecutive_rejections: u32,
    accepted_scores: Vec<f64>,
    patch_plan: Option<PatchPlan>,
    last_overflow: Vec<OverflowOffender>,
    /// Files of the last accepted generation; after a rollback this is what
    /// the workspace actually contains.
    workspace_files: Vec<codegen::GeneratedFile>,
    best_node_iteration: Option<u32>,
    scorekeeper: Scorekeeper,
    locks: LockManager,
    planner: PatchPlanner,
    stop: StopController,
    started: Instant,
}

impl RunOrchestrator {
    /// Execute the run to completion. Emits `runStarted` before any event and
    /// exactly one `runFinished` at the end, regardless of outcome.
    pub async fn run(mut self) {
        self.bus.run_started(&self.project_id, &self.run_id);
        self.emit(
            ROOT_NODE_ID,
            None,
            EventType::NodeStarted,
            EventPayload {
                title: Some(format!("Run {}", self.run_id)),
                ..EventPayload::default()
            },
        );

        match self.drive().await {
            Ok(reason) => {
                info!(run = %self.run_id, reason = %reason, "run finished");
                self.emit(
                    ROOT_NODE_ID,
                    None,
                    EventType::NodeFinished,
                    EventPayload {
                        message: Some(reason),
                        ..EventPayload::default()
                    },
                );
                self.bus
                    .run_finished(&self.project_id, &self.run_id, RunOutcome::Success);
            }
            Err(RunError::Cancelled) => {
                info!(run = %self.run_id, "run cancelled");
                self.emit(
                    ROOT_NODE_ID,
                    None,
                    EventType::NodeFailed,
                    EventPayload {
                        message: Some("run cancelled".to_string()),
                        ..EventPayload::default()
                    },
                );
                self.bus
                    .run_finished(&self.project_id, &self.run_id, RunOutcome::Error);
            }
            Err(err) => {
                warn!(run = %self.run_id, error = %err, "run failed");
                self.emit(
                    ROOT_NODE_ID,
                    None,
                    EventType::NodeFailed,
                    EventPayload {
                        message: Some(err.to_string()),
                        ..EventPayload::default()
                    },
                );
                self.bus
                    .run_finished(&self.project_id, &self.run_id, RunOutcome::Error);
            }
        }
    }

    async fn drive(&mut self) -> Result<String, RunError> {
        let run_defaults = self.pack.manifest.run_defaults.clone();
        let target = self.pack.resolve_target(&run_defaults.target_id)?.clone();
        let nodes: Vec<_> = self.pack.ir.nodes_for(&target.target_id).to_vec();

        let mut state = RunState {
            iteration: 0,
            previous_score: None,
            consecutive_rejections: 0,
            accepted_scores: Vec::new(),
            patch_plan: None,
            last_overflow: Vec::new(),
            workspace_files: Vec::new(),
            best_node_iteration: None,
            scorekeeper: Scorekeeper::new(self.settings.epsilon),
            locks: LockManager::new(
                self.settings.layout_lock_threshold,
                self.settings.style_lock_threshold,
            ),
            planner: PatchPlanner::with_max_targets(self.settings.max_patch_targets),
            stop: StopController {
                max_iterations: run_defaults.max_iterations,
                max_consecutive_rejections: self.settings.max_consecutive_rejections,
                plateau_window: self.settings.plateau_window,
                plateau_threshold: self.settings.plateau_threshold,
                time_budget: Duration::from_secs(self.settings.time_budget_secs),
            },
            started: Instant::now(),
        };

        loop {
            self.check_stop()?;
            let iter_node = format!("root-iter{}", state.iteration);
            self.emit(
                &iter_node,
                Some(ROOT_NODE_ID),
                EventType::NodeCreated,
                EventPayload {
                    step_key: Some("iteration".to_string()),
                    title: Some(format!("Iteration {}", state.iteration)),
                    ..EventPayload::default()
                },
            );
            self.emit(
                &iter_node,
                Some(ROOT_NODE_ID),
                EventType::NodeStarted,
                EventPayload::default(),
            );
            if let Some(plan) = &state.patch_plan {
                self.emit(
                    &iter_node,
                    Some(ROOT_NODE_ID),
                    EventType::NodeProgress,
                    EventPayload {
                        message: Some(format!("focusing {}", plan.focus_area.as_str())),
                        focus_area: Some(plan.focus_area.as_str().to_string()),
                        ..EventPayload::default()
                    },
                );
            }

            match self.run_iteration(&mut state, &iter_node, &target.route, &nodes).await {
                Ok(Some(reason)) => return Ok(reason),
                Ok(None) => {}
                Err(RunError::Cancelled) => return Err(RunError::Cancelled),
                Err(err) => {
                    self.emit(
                        &iter_node,
                        Some(ROOT_NODE_ID),
                        EventType::NodeFailed,
                        EventPayload {
                            message: Some(err.to_string()),
                            ..EventPayload::default()
                        },
                    );
                    return Err(err);
                }
            }

            let inputs = StopInputs {
                iteration: state.iteration,
                accepted_scores: &state.accepted_scores,
                consecutive_rejections: state.consecutive_rejections,
                start_time: state.started,
            };
            if let Some(reason) = state.stop.check(&inputs) {
                return Ok(reason.as_str().to_string());
            }

            // Plan the next iteration around the last accepted score.
            if let Some(previous) = state.previous_score {
                state.patch_plan = Some(state.planner.plan(&previous, &nodes, &state.locks));
            }
            state.iteration += 1;
        }
    }

    /// One pass of the pipeline. `Ok(Some(reason))` ends the run successfully.
    async fn run_iteration(
        &mut self,
        state: &mut RunState,
        iter_node: &str,
        route: &str,
        nodes: &[crate::pack::IrNode],
    ) -> Result<Option<String>, RunError> {
        // 1. Code generation
        let files = self.step_codegen(state, iter_node).await?;
        self.check_stop()?;

        // 2. Preview readiness + route warm-up
        let preview_url = self.step_preview(iter_node, route).await?;
        self.check_stop()?;

        // 3. Screenshot capture per breakpoint
        let captured = self.step_screenshots(iter_node, &preview_url, route).await?;
        self.check_stop()?;

        // Snapshot every iteration that reached its screenshots, accepted or
        // not, so any of them can be rolled back to. Failures are logged,
        // never fatal.
        if let Err(err) = self
            .snapshots
            .create(&self.project_id, state.iteration, &self.paths.workspace())
            .await
        {
            warn!(iteration = state.iteration, error = %err, "snapshot create failed");
        }

        // 4. Overflow inspection (best-effort)
        self.step_overflow(state, iter_node, &preview_url, route).await;
        self.check_stop()?;

        // 5. Visual scoring
        let aggregate = self.step_score(iter_node, &captured).await?;
        self.check_stop()?;

        // 6. Decision
        self.step_decide(state, iter_node, nodes, aggregate, files).await
    }

    async fn step_codegen(
        &mut self,
        state: &RunState,
        iter_node: &str,
    ) -> Result<Vec<codegen::GeneratedFile>, RunError> {
        let node = format!("{iter_node}-codegen");
        self.step_started(&node, iter_node, "codegen", "Generate code");

        let prompt = self.build_prompt(state);
        let mut stop_rx = self.stop_rx.clone();
        let response = tokio::select! {
            response = self.codegen.generate(&prompt) => {
                response.map_err(|e| RunError::CodeGen(e.to_string()))
            }
            _ = stop_tripped(&mut stop_rx) => Err(RunError::Cancelled),
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => return Err(self.fail_step(&node, iter_node, err)),
        };

        let files = codegen::parse_response(&response);
        if files.is_empty() {
            return Err(self.fail_step(&node, iter_node, RunError::EmptyGeneration));
        }

        let written = codegen::write_files(&self.paths.workspace(), &files)
            .await
            .map_err(RunError::Other);
        let written = match written {
            Ok(written) => written,
            Err(err) => return Err(self.fail_step(&node, iter_node, err)),
        };
        for (file, path) in files.iter().zip(&written) {
            self.emit(
                &node,
                Some(iter_node),
                EventType::ArtifactAdded,
                EventPayload {
                    artifact: Some(Artifact {
                        kind: "file".to_string(),
                        label: file.relative_path.clone(),
                        path: Some(path.display().to_string()),
                        size_bytes: Some(file.contents.len() as u64),
                    }),
                    ..EventPayload::default()
                },
            );
        }
        self.step_finished(&node, iter_node, Some(format!("{} files", files.len())));
        Ok(files)
    }

    async fn step_preview(&mut self, iter_node: &str, route: &str) -> Result<String, RunError> {
        let node = format!("{iter_node}-preview");
        self.step_started(&node, iter_node, "preview", "Start preview");

        if let Err(err) = self
            .sandbox
            .start_current(&self.project_id, &self.paths.workspace())
            .await
        {
            return Err(self.fail_step(&node, iter_node, RunError::Sandbox(err)));
        }

        let deadline = Instant::now() + Duration::from_secs(self.settings.preview_timeout_secs);
        let preview_url = loop {
            self.check_stop()?;
            let info = self.sandbox.current_status(&self.project_id).await;
            match info.status {
                PreviewStatus::Ready => {
                    match info.preview_url {
                        Some(url) => break url,
                        None => {
                            let err = RunError::Preview("ready preview has no URL".to_string());
                            return Err(self.fail_step(&node, iter_node, err));
                        }
                    }
                }
                PreviewStatus::Error => {
                    let message = info
                        .error
                        .unwrap_or_else(|| "preview failed to start".to_string());
                    return Err(self.fail_step(&node, iter_node, RunError::Preview(message)));
                }
                _ if Instant::now() >= deadline => {
                    let err = RunError::Preview(format!(
                        "preview not ready within {}s",
                        self.settings.preview_timeout_secs
                    ));
                    return Err(self.fail_step(&node, iter_node, err));
                }
                _ => tokio::time::sleep(PREVIEW_POLL_INTERVAL).await,
            }
        };

        self.emit(
            &node,
            Some(iter_node),
            EventType::NodeProgress,
            EventPayload {
                message: Some("warming route".to_string()),
                ..EventPayload::default()
            },
        );
        self.warm_route(&preview_url, route).await?;

        self.step_finished(&node, iter_node, Some(preview_url.clone()));
        Ok(preview_url)
    }

    /// Poll the target route until it answers with something other than 404,
    /// then give in-place recompilation a moment to settle. Best-effort: the
    /// cap expiring only logs.
    async fn warm_route(&self, preview_url: &str, route: &str) -> Result<(), RunError> {
        let url = format!("{preview_url}{route}");
        let deadline = Instant::now() + Duration::from_secs(self.settings.warmup_timeout_secs);
        loop {
            self.check_stop()?;
            match self.http.get(&url).send().await {
                Ok(response) if response.status() != reqwest::StatusCode::NOT_FOUND => {
                    tokio::time::sleep(Duration::from_millis(self.settings.settle_ms)).await;
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                warn!(url = %url, "route warm-up window lapsed without a non-404 response");
                return Ok(());
            }
            tokio::time::sleep(WARMUP_POLL_INTERVAL).await;
        }
    }

    async fn step_screenshots(
        &mut self,
        iter_node: &str,
        preview_url: &str,
        route: &str,
    ) -> Result<Vec<(String, std::path::PathBuf)>, RunError> {
        let node = format!("{iter_node}-screenshot");
        self.step_started(&node, iter_node, "screenshot", "Capture screenshots");

        if let Err(err) = tokio::fs::create_dir_all(self.paths.run_shots_dir(&self.run_id)).await {
            return Err(self.fail_step(&node, iter_node, RunError::Other(err.into())));
        }

        let url = format!("{preview_url}{route}");
        let breakpoints = self.pack.manifest.breakpoints.clone();
        let mut captured = Vec::new();
        for breakpoint in &breakpoints {
            self.check_stop()?;
            let bp_node = format!("{node}-{}", breakpoint.breakpoint_id);
            self.step_started(&bp_node, &node, "breakpoint", &breakpoint.breakpoint_id);

            let out_path = self
                .paths
                .screenshot(&self.run_id, &breakpoint.breakpoint_id);
            let viewport = Viewport {
                width: breakpoint.width,
                height: breakpoint.height,
                device_scale_factor: breakpoint.device_scale_factor,
            };
            match self.probe.screenshot(&url, viewport, &out_path).await {
                Ok(size_bytes) => {
                    self.emit(
                        &bp_node,
                        Some(&node),
                        EventType::ArtifactAdded,
                        EventPayload {
                            artifact: Some(Artifact {
                                kind: "screenshot".to_string(),
                                label: breakpoint.breakpoint_id.clone(),
                                path: Some(out_path.display().to_string()),
                                size_bytes: Some(size_bytes),
                            }),
                            ..EventPayload::default()
                        },
                    );
                    self.step_finished(&bp_node, &node, None);
                    captured.push((breakpoint.breakpoint_id.clone(), out_path));
                }
                Err(err) => {
                    // One bad viewport does not sink the iteration.
                    warn!(breakpoint = %breakpoint.breakpoint_id, error = %err, "breakpoint capture failed");
                    self.emit(
                        &bp_node,
                        Some(&node),
                        EventType::NodeFailed,
                        EventPayload {
                            message: Some(err.to_string()),
                            ..EventPayload::default()
                        },
                    );
                }
            }
        }

        if captured.is_empty() {
            return Err(self.fail_step(&node, iter_node, RunError::AllCapturesFailed));
        }
        self.step_finished(
            &node,
            iter_node,
            Some(format!("{}/{} breakpoints", captured.len(), breakpoints.len())),
        );
        Ok(captured)
    }

    /// Overflow inspection at the primary breakpoint. Never fails the
    /// iteration; a failed scan means no overflow context next round.
    async fn step_overflow(
        &mut self,
        state: &mut RunState,
        iter_node: &str,
        preview_url: &str,
        route: &str,
    ) {
        let node = format!("{iter_node}-overflow");
        self.step_started(&node, iter_node, "overflow", "Inspect overflow");

        let primary = self.pack.manifest.primary_breakpoint().clone();
        let viewport = Viewport {
            width: primary.width,
            height: primary.height,
            device_scale_factor: primary.device_scale_factor,
        };
        let url = format!("{preview_url}{route}");
        match self.probe.overflow_scan(&url, viewport).await {
            Ok(report) => {
                let report_path = self.paths.overflow_report(&self.run_id, state.iteration);
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => {
                        if let Err(err) = tokio::fs::write(&report_path, json).await {
                            warn!(error = %err, "failed to persist overflow report");
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to serialize overflow report"),
                }
                state.last_overflow = report.top(OVERFLOW_PROMPT_LIMIT);
                self.step_finished(
                    &node,
                    iter_node,
                    Some(format!("{} offenders", report.offenders.len())),
                );
            }
            Err(err) => {
                warn!(error = %err, "overflow scan failed; treating as no overflow");
                state.last_overflow = Vec::new();
                self.emit(
                    &node,
                    Some(iter_node),
                    EventType::NodeFailed,
                    EventPayload {
                        message: Some(err.to_string()),
                        ..EventPayload::default()
                    },
                );
            }
        }
    }

    async fn step_score(
        &mut self,
        iter_node: &str,
        captured: &[(String, std::path::PathBuf)],
    ) -> Result<ScoreVector, RunError> {
        let node = format!("{iter_node}-score");
        self.step_started(&node, iter_node, "score", "Score against baselines");

        let target_id = self.pack.manifest.run_defaults.target_id.clone();
        let state_id = self.pack.manifest.default_state_id().to_string();
        let ir_summary = self.ir_summary(&target_id);

        let mut per_breakpoint = Vec::new();
        for (breakpoint_id, candidate) in captured {
            self.check_stop()?;
            let baseline = self
                .pack
                .baseline_path(&target_id, breakpoint_id, &state_id);
            let value = self
                .scorer
                .score(&baseline, candidate, &ir_summary)
                .await
                .map_err(RunError::Other);
            let value = match value {
                Ok(value) => value,
                Err(err) => return Err(self.fail_step(&node, iter_node, err)),
            };
            let scores = parse_score_response(&value);
            self.emit(
                &node,
                Some(iter_node),
                EventType::NodeProgress,
                EventPayload {
                    message: Some(format!("{breakpoint_id}: {:.2}", scores.overall())),
                    ..EventPayload::default()
                },
            );
            per_breakpoint.push(scores);
        }

        let aggregate = match ScoreVector::mean(&per_breakpoint) {
            Some(aggregate) => aggregate,
            None => {
                return Err(self.fail_step(&node, iter_node, RunError::AllCapturesFailed));
            }
        };
        self.emit(
            &node,
            Some(iter_node),
            EventType::NodeFinished,
            EventPayload {
                score: Some(aggregate),
                message: Some(format!("overall {:.2}", aggregate.overall())),
                ..EventPayload::default()
            },
        );
        Ok(aggregate)
    }

    async fn step_decide(
        &mut self,
        state: &mut RunState,
        iter_node: &str,
        nodes: &[crate::pack::IrNode],
        aggregate: ScoreVector,
        files: Vec<codegen::GeneratedFile>,
    ) -> Result<Option<String>, RunError> {
        let node = format!("{iter_node}-decision");
        self.step_started(&node, iter_node, "decision", "Decide");

        let overall = aggregate.overall();
        let decision = state.scorekeeper.evaluate(state.iteration, overall);
        let newly_locked = state.locks.update(&aggregate, nodes);
        if !newly_locked.is_empty() {
            info!(count = newly_locked.len(), "locked nodes");
        }

        if decision.accepted {
            state.accepted_scores.push(overall);
            state.consecutive_rejections = 0;
            state.previous_score = Some(aggregate);
            state.workspace_files = files;

            // The best flag migrates to this iteration.
            if let Some(previous_best) = state.best_node_iteration.take() {
                self.emit(
                    &format!("root-iter{previous_best}"),
                    Some(ROOT_NODE_ID),
                    EventType::NodeProgress,
                    EventPayload {
                        is_best: Some(false),
                        ..EventPayload::default()
                    },
                );
            }
            state.best_node_iteration = Some(state.iteration);

            self.step_finished(&node, iter_node, Some(decision.reason.as_str().to_string()));
            self.emit(
                iter_node,
                Some(ROOT_NODE_ID),
                EventType::NodeFinished,
                EventPayload {
                    score: Some(aggregate),
                    decision: Some(decision.reason.as_str().to_string()),
                    is_best: Some(true),
                    ..EventPayload::default()
                },
            );

            if overall >= self.settings_threshold() {
                return Ok(Some("threshold met".to_string()));
            }
        } else {
            state.consecutive_rejections += 1;
            self.step_finished(&node, iter_node, Some(decision.reason.as_str().to_string()));
            self.emit(
                iter_node,
                Some(ROOT_NODE_ID),
                EventType::NodeFinished,
                EventPayload {
                    score: Some(aggregate),
                    decision: Some(decision.reason.as_str().to_string()),
                    ..EventPayload::default()
                },
            );

            // Roll the workspace back to the best iteration so the next
            // attempt starts from the strongest base. A failed restore is
            // logged; the run continues on whatever state exists.
            if let Some(best_iteration) = state.scorekeeper.best_iteration()
                && let Err(err) = self
                    .snapshots
                    .restore(&self.project_id, best_iteration, &self.paths.workspace())
                    .await
            {
                warn!(best_iteration, error = %err, "rollback restore failed");
            }
        }

        Ok(None)
    }

    fn settings_threshold(&self) -> f64 {
        self.pack.manifest.run_defaults.threshold
    }

    fn build_prompt(&self, state: &RunState) -> String {
        let target_id = &self.pack.manifest.run_defaults.target_id;
        let mut prompt = String::new();
        prompt.push_str(&format!(
            "Implement the page for target '{target_id}' so it matches the design.\n\n"
        ));
        prompt.push_str("## DESIGN NODES\n");
        match serde_json::to_string_pretty(&self.pack.ir.nodes_for(target_id)) {
            Ok(nodes_json) => prompt.push_str(&nodes_json),
            Err(_) => prompt.push_str("[]"),
        }
        prompt.push('\n');

        if !state.workspace_files.is_empty() {
            prompt.push_str("\n## CURRENT CODE\n");
            for file in &state.workspace_files {
                prompt.push_str(&format!(
                    "<file path=\"{}\">\n{}\n</file>\n",
                    file.relative_path, file.contents
                ));
            }
        }

        if let Some(previous) = &state.previous_score {
            prompt.push_str(&format!(
                "\n## PREVIOUS SCORES\nlayout {:.2}, style {:.2}, a11y {:.2}, perceptual {:.2}, overall {:.2}\n",
                previous.layout,
                previous.style,
                previous.a11y,
                previous.perceptual,
                previous.overall()
            ));
        }

        if let Some(plan) = &state.patch_plan {
            prompt.push_str("\n## PATCH PLAN\n");
            if let Ok(plan_json) = serde_json::to_string_pretty(plan) {
                prompt.push_str(&plan_json);
                prompt.push('\n');
            }
        }

        if !state.last_overflow.is_empty() {
            prompt.push_str("\n## OVERFLOW OFFENDERS\n");
            if let Ok(overflow_json) = serde_json::to_string_pretty(&state.last_overflow) {
                prompt.push_str(&overflow_json);
                prompt.push('\n');
            }
        }

        prompt.push_str(
            "\nRespond with exactly one <files> block containing <file path=\"...\"> entries.\n",
        );
        prompt
    }

    fn ir_summary(&self, target_id: &str) -> String {
        serde_json::to_string(&self.pack.ir.nodes_for(target_id)).unwrap_or_else(|_| "[]".into())
    }

    fn check_stop(&self) -> Result<(), RunError> {
        if *self.stop_rx.borrow() {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    fn step_started(&self, node: &str, parent: &str, step_key: &str, title: &str) {
        self.emit(
            node,
            Some(parent),
            EventType::NodeCreated,
            EventPayload {
                step_key: Some(step_key.to_string()),
                title: Some(title.to_string()),
                ..EventPayload::default()
            },
        );
        self.emit(node, Some(parent), EventType::NodeStarted, EventPayload::default());
    }

    fn step_finished(&self, node: &str, parent: &str, message: Option<String>) {
        self.emit(
            node,
            Some(parent),
            EventType::NodeFinished,
            EventPayload {
                message,
                ..EventPayload::default()
            },
        );
    }

    /// Emit `nodeFailed` on a step node and hand the error back for the
    /// iteration to fail with.
    fn fail_step(&self, node: &str, parent: &str, err: RunError) -> RunError {
        self.emit(
            node,
            Some(parent),
            EventType::NodeFailed,
            EventPayload {
                message: Some(err.to_string()),
                ..EventPayload::default()
            },
        );
        err
    }

    fn emit(&self, node_id: &str, parent_id: Option<&str>, event_type: EventType, payload: EventPayload) {
        let event = AgentEvent::new(&self.project_id, node_id, parent_id, event_type, payload)
            .with_pack(&self.pack.pack_id);
        self.bus.publish(event);
    }
}

/// Resolves when the stop flag flips to true; pends forever otherwise.
async fn stop_tripped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without tripping: nothing will ever stop us here.
            std::future::pending::<()>().await;
        }
    }
}
