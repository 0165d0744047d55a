//! The refinement engine: decision logic, providers, and the run registry.

pub mod codegen;
pub mod locks;
pub mod orchestrator;
pub mod plan;
pub mod providers;
pub mod score;
pub mod stop;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::RunError;
use crate::pack::DesignPack;
use crate::paths::ProjectPaths;
use crate::sandbox::{PreviewInfo, SandboxManager};
use crate::snapshot::SnapshotStore;
use crate::trace::TraceBus;

use orchestrator::RunOrchestrator;
use providers::{CliCodeGen, CliProbe, CliScorer, CodeGenProvider, PageProbe, VisionScorer};

/// Handle to a run in flight.
struct RunHandle {
    run_id: String,
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

/// Front-end over the whole core: owns the sandbox manager, the snapshot
/// store, the trace bus, the providers, and the per-project run slots.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    sandbox: SandboxManager,
    snapshots: SnapshotStore,
    bus: TraceBus,
    codegen: Arc<dyn CodeGenProvider>,
    scorer: Arc<dyn VisionScorer>,
    probe: Arc<dyn PageProbe>,
    active: Arc<Mutex<HashMap<String, RunHandle>>>,
}

impl Engine {
    /// Build an engine with the subprocess-backed providers from the config.
    pub fn new(config: EngineConfig) -> Self {
        let codegen = Arc::new(CliCodeGen::new(config.providers.codegen_cmd.clone()));
        let scorer = Arc::new(CliScorer::new(config.providers.scorer_cmd.clone()));
        let probe = Arc::new(CliProbe::new(config.providers.probe_cmd.clone()));
        Self::with_providers(config, codegen, scorer, probe)
    }

    /// Build an engine with explicit providers. Tests use this to substitute
    /// doubles.
    pub fn with_providers(
        config: EngineConfig,
        codegen: Arc<dyn CodeGenProvider>,
        scorer: Arc<dyn VisionScorer>,
        probe: Arc<dyn PageProbe>,
    ) -> Self {
        let sandbox = SandboxManager::new(config.sandbox.clone());
        let snapshots = SnapshotStore::new(&config.storage_dir, &config.sandbox.deps_dir);
        Self {
            config: Arc::new(config),
            sandbox,
            snapshots,
            bus: TraceBus::new(),
            codegen,
            scorer,
            probe,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> &TraceBus {
        &self.bus
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run for a project. A predecessor run is stopped and its slot
    /// taken immediately; the new run then proceeds independently.
    pub async fn start_run(&self, project_id: &str, pack_id: &str) -> Result<String, RunError> {
        let paths = ProjectPaths::new(&self.config.storage_dir, project_id);
        if !paths.root().is_dir() {
            return Err(RunError::UnknownProject(project_id.to_string()));
        }
        let pack = DesignPack::load(&paths, pack_id).await?;
        // Fail on an unresolvable default target before claiming the slot.
        pack.resolve_target(&pack.manifest.run_defaults.target_id)?;

        let run_id = Uuid::new_v4().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);

        let orchestrator = RunOrchestrator {
            run_id: run_id.clone(),
            project_id: project_id.to_string(),
            pack,
            paths,
            settings: self.config.run.clone(),
            sandbox: self.sandbox.clone(),
            snapshots: self.snapshots.clone(),
            bus: self.bus.clone(),
            codegen: Arc::clone(&self.codegen),
            scorer: Arc::clone(&self.scorer),
            probe: Arc::clone(&self.probe),
            stop_rx,
            http: reqwest::Client::new(),
        };

        let mut active = self.active.lock().await;
        if let Some(previous) = active.remove(project_id) {
            info!(project = %project_id, superseded = %previous.run_id, "stopping superseded run");
            let _ = previous.stop_tx.send(true);
        }

        let join = tokio::spawn(orchestrator.run());
        active.insert(
            project_id.to_string(),
            RunHandle {
                run_id: run_id.clone(),
                stop_tx,
                join,
            },
        );
        Ok(run_id)
    }

    /// Trip the stop flag of a project's active run. Returns whether a run
    /// was there to stop.
    pub async fn stop_run(&self, project_id: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.remove(project_id) {
            Some(handle) => {
                let _ = handle.stop_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Start (or touch) a historical preview serving an iteration snapshot.
    pub async fn start_historical_preview(
        &self,
        project_id: &str,
        iteration: u32,
    ) -> Result<PreviewInfo, RunError> {
        let runtime_dir = self
            .snapshots
            .extract(project_id, iteration)
            .await
            .map_err(|e| RunError::Other(e.into()))?;
        Ok(self
            .sandbox
            .start_historical(project_id, iteration, &runtime_dir)
            .await?)
    }

    /// Stop every run and preview. Called on shutdown.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (project_id, handle) in active.drain() {
            info!(project = %project_id, run = %handle.run_id, "stopping run for shutdown");
            let _ = handle.stop_tx.send(true);
            handle.join.abort();
        }
        drop(active);
        self.sandbox.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_at(storage: &std::path::Path) -> Engine {
        let config = EngineConfig {
            storage_dir: storage.to_path_buf(),
            ..EngineConfig::default()
        };
        Engine::new(config)
    }

    #[tokio::test]
    async fn test_start_run_unknown_project() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_at(tmp.path());
        match engine.start_run("ghost", "pack1").await {
            Err(RunError::UnknownProject(id)) => assert_eq!(id, "ghost"),
            other => panic!("Expected UnknownProject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_run_unknown_pack() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("projects/p1")).unwrap();
        let engine = engine_at(tmp.path());
        match engine.start_run("p1", "nope").await {
            Err(RunError::UnknownPack(id)) => assert_eq!(id, "nope"),
            other => panic!("Expected UnknownPack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_run_without_active_run() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_at(tmp.path());
        assert!(!engine.stop_run("p1").await);
    }
}
