//! Preview pools: one current preview per project, a bounded pool of
//! historical previews across all projects, a periodic idle reaper, and
//! forced shutdown.
//!
//! Both keyed maps live behind a single async mutex, so every pool operation
//! is atomic with respect to the others. Startup (install + spawn + readiness
//! watch) runs in a detached task that writes its progress back into the
//! entry; callers observe it through `status`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

use super::process::{
    self, ReadyOutcome, SpawnedServer, alloc_port, await_ready, terminate_group,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Installing,
    Starting,
    Ready,
    Stopped,
    Error,
}

impl PreviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Terminal entries are replaced by the next `start` call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Snapshot of one preview process, as exposed to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    pub status: PreviewStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreviewInfo {
    fn stopped() -> Self {
        Self {
            preview_url: None,
            status: PreviewStatus::Stopped,
            error: None,
        }
    }
}

struct PreviewEntry {
    port: u16,
    pgid: Option<i32>,
    status: PreviewStatus,
    error: Option<String>,
    started_at: Instant,
    last_accessed: Instant,
}

impl PreviewEntry {
    fn new(port: u16) -> Self {
        let now = Instant::now();
        Self {
            port,
            pgid: None,
            status: PreviewStatus::Installing,
            error: None,
            started_at: now,
            last_accessed: now,
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    fn info(&self) -> PreviewInfo {
        PreviewInfo {
            preview_url: (self.status == PreviewStatus::Ready)
                .then(|| format!("http://127.0.0.1:{}", self.port)),
            status: self.status,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Current(String),
    Historical(String, u32),
}

#[derive(Default)]
struct Pools {
    current: HashMap<String, PreviewEntry>,
    historical: HashMap<(String, u32), PreviewEntry>,
    reaper_enabled: bool,
}

impl Pools {
    fn entry_mut(&mut self, key: &EntryKey) -> Option<&mut PreviewEntry> {
        match key {
            EntryKey::Current(p) => self.current.get_mut(p),
            EntryKey::Historical(p, i) => self.historical.get_mut(&(p.clone(), *i)),
        }
    }
}

/// Owner of every preview subprocess and its port.
#[derive(Clone)]
pub struct SandboxManager {
    settings: Arc<SandboxSettings>,
    pools: Arc<Mutex<Pools>>,
}

impl SandboxManager {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            pools: Arc::new(Mutex::new(Pools {
                reaper_enabled: true,
                ..Pools::default()
            })),
        }
    }

    /// Start (or return) the current preview for a project.
    ///
    /// A live entry is touched and returned untouched otherwise; its port and
    /// URL never change while it stays alive.
    pub async fn start_current(
        &self,
        project_id: &str,
        workspace_dir: &Path,
    ) -> Result<PreviewInfo, SandboxError> {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools.current.get_mut(project_id)
            && !entry.status.is_terminal()
        {
            entry.touch();
            return Ok(entry.info());
        }

        let port = alloc_port()?;
        let entry = PreviewEntry::new(port);
        let info = entry.info();
        pools.current.insert(project_id.to_string(), entry);
        drop(pools);

        self.spawn_startup(
            EntryKey::Current(project_id.to_string()),
            workspace_dir.to_path_buf(),
            port,
        );
        Ok(info)
    }

    /// Start (or return) a historical preview serving an iteration's
    /// extracted snapshot. Evicts the least-recently-accessed live historical
    /// preview when the pool is at capacity.
    pub async fn start_historical(
        &self,
        project_id: &str,
        iteration: u32,
        runtime_dir: &Path,
    ) -> Result<PreviewInfo, SandboxError> {
        let mut pools = self.pools.lock().await;
        let key = (project_id.to_string(), iteration);
        if let Some(entry) = pools.historical.get_mut(&key)
            && !entry.status.is_terminal()
        {
            entry.touch();
            return Ok(entry.info());
        }

        while live_historical_count(&pools) >= self.settings.historical_capacity {
            let Some(victim) = pools
                .historical
                .iter()
                .filter(|(_, e)| !e.status.is_terminal())
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = pools.historical.remove(&victim) {
                info!(project = %victim.0, iteration = victim.1, "evicting idle historical preview");
                terminate_group(entry.pgid);
            }
        }

        let port = alloc_port()?;
        let entry = PreviewEntry::new(port);
        let info = entry.info();
        pools.historical.insert(key, entry);
        drop(pools);

        self.spawn_startup(
            EntryKey::Historical(project_id.to_string(), iteration),
            runtime_dir.to_path_buf(),
            port,
        );
        Ok(info)
    }

    pub async fn current_status(&self, project_id: &str) -> PreviewInfo {
        let mut pools = self.pools.lock().await;
        match pools.current.get_mut(project_id) {
            Some(entry) => {
                entry.touch();
                entry.info()
            }
            None => PreviewInfo::stopped(),
        }
    }

    pub async fn historical_status(&self, project_id: &str, iteration: u32) -> PreviewInfo {
        let mut pools = self.pools.lock().await;
        match pools
            .historical
            .get_mut(&(project_id.to_string(), iteration))
        {
            Some(entry) => {
                entry.touch();
                entry.info()
            }
            None => PreviewInfo::stopped(),
        }
    }

    /// Best-effort termination of the current preview.
    pub async fn stop_current(&self, project_id: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools.current.remove(project_id) {
            terminate_group(entry.pgid);
        }
    }

    pub async fn stop_historical(&self, project_id: &str, iteration: u32) {
        let mut pools = self.pools.lock().await;
        if let Some(entry) = pools
            .historical
            .remove(&(project_id.to_string(), iteration))
        {
            terminate_group(entry.pgid);
        }
    }

    /// Terminate every tracked process and disable the reaper. Called on
    /// shutdown.
    pub async fn stop_all(&self) {
        let mut pools = self.pools.lock().await;
        pools.reaper_enabled = false;
        for (project_id, entry) in pools.current.drain() {
            info!(project = %project_id, "stopping current preview");
            terminate_group(entry.pgid);
        }
        for ((project_id, iteration), entry) in pools.historical.drain() {
            info!(project = %project_id, iteration, "stopping historical preview");
            terminate_group(entry.pgid);
        }
    }

    /// Spawn the periodic idle reaper. Runs until `stop_all` disables it.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let interval = Duration::from_secs(manager.settings.reap_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !manager.reap_idle().await {
                    return;
                }
            }
        })
    }

    /// One reaper pass. Returns false once the reaper has been disabled.
    async fn reap_idle(&self) -> bool {
        let current_ttl = Duration::from_secs(self.settings.current_ttl_secs);
        let historical_ttl = Duration::from_secs(self.settings.historical_ttl_secs);

        let mut pools = self.pools.lock().await;
        if !pools.reaper_enabled {
            return false;
        }

        let stale_current: Vec<String> = pools
            .current
            .iter()
            .filter(|(_, e)| e.status == PreviewStatus::Ready && e.last_accessed.elapsed() > current_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_current {
            if let Some(entry) = pools.current.remove(&key) {
                info!(project = %key, "reaping idle current preview");
                terminate_group(entry.pgid);
            }
        }

        let stale_historical: Vec<(String, u32)> = pools
            .historical
            .iter()
            .filter(|(_, e)| {
                e.status == PreviewStatus::Ready && e.last_accessed.elapsed() > historical_ttl
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale_historical {
            if let Some(entry) = pools.historical.remove(&key) {
                info!(project = %key.0, iteration = key.1, "reaping idle historical preview");
                terminate_group(entry.pgid);
            }
        }
        true
    }

    fn spawn_startup(&self, key: EntryKey, dir: PathBuf, port: u16) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_startup(key, dir, port).await;
        });
    }

    /// Full startup sequence for one preview process. Progress is written
    /// back into the pool entry; a vanished entry means the preview was
    /// stopped or replaced mid-startup and the sequence aborts.
    async fn run_startup(&self, key: EntryKey, dir: PathBuf, port: u16) {
        if let Err(err) = process::ensure_manifest(&self.settings, &dir).await {
            self.fail_entry(&key, &err.to_string()).await;
            return;
        }

        if let Err(err) = process::ensure_dependencies(&self.settings, &dir).await {
            warn!(error = %err, "dependency install failed");
            self.fail_entry(&key, &err.to_string()).await;
            return;
        }

        let server = match process::spawn_server(&self.settings, &dir, port) {
            Ok(server) => server,
            Err(err) => {
                self.fail_entry(&key, &err.to_string()).await;
                return;
            }
        };

        let pgid = server.pgid;
        let registered = self
            .update_entry(&key, |e| {
                e.status = PreviewStatus::Starting;
                e.pgid = pgid;
            })
            .await;
        if registered.is_none() {
            // Stopped while installing; don't leak the fresh child.
            terminate_group(pgid);
            return;
        }

        self.watch_until_ready(key, server).await;
    }

    async fn watch_until_ready(&self, key: EntryKey, mut server: SpawnedServer) {
        let timeout = Duration::from_secs(self.settings.ready_timeout_secs);
        match await_ready(&mut server, timeout).await {
            ReadyOutcome::Ready => {
                let startup = self
                    .update_entry(&key, |e| {
                        e.status = PreviewStatus::Ready;
                        e.started_at.elapsed()
                    })
                    .await;
                match startup {
                    Some(elapsed) => {
                        info!(startup_ms = elapsed.as_millis() as u64, "dev server ready");
                        self.monitor_exit(key, server);
                    }
                    // Stopped while starting up.
                    None => terminate_group(server.pgid),
                }
            }
            ReadyOutcome::Exited { exit_code } => {
                let err = SandboxError::ExitedBeforeReady { exit_code };
                self.fail_entry(&key, &err.to_string()).await;
            }
            ReadyOutcome::TimedOut => {
                terminate_group(server.pgid);
                let err = SandboxError::ReadinessTimeout {
                    timeout_secs: timeout.as_secs(),
                };
                self.fail_entry(&key, &err.to_string()).await;
            }
        }
    }

    /// Keep ownership of the child and record an unexpected exit.
    fn monitor_exit(&self, key: EntryKey, mut server: SpawnedServer) {
        let manager = self.clone();
        tokio::spawn(async move {
            let status = server.child.wait().await;
            let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            let updated = manager
                .update_entry(&key, |e| {
                    if e.status == PreviewStatus::Ready {
                        e.status = PreviewStatus::Error;
                        e.error = Some(format!("dev server exited with code {exit_code}"));
                    }
                })
                .await;
            if updated.is_some() {
                warn!(exit_code, "dev server exited while registered");
            }
        });
    }

    async fn fail_entry(&self, key: &EntryKey, message: &str) {
        self.update_entry(key, |e| {
            e.status = PreviewStatus::Error;
            e.error = Some(message.to_string());
        })
        .await;
    }

    /// Apply a mutation to the entry if it still exists; `None` means the
    /// preview was stopped or replaced in the meantime.
    async fn update_entry<R>(
        &self,
        key: &EntryKey,
        f: impl FnOnce(&mut PreviewEntry) -> R,
    ) -> Option<R> {
        let mut pools = self.pools.lock().await;
        pools.entry_mut(key).map(f)
    }
}

fn live_historical_count(pools: &Pools) -> usize {
    pools
        .historical
        .values()
        .filter(|e| !e.status.is_terminal())
        .count()
}
