//! Engine configuration.
//!
//! Settings live in an optional `reify.toml` at the storage root. Every field
//! has a default so a missing file, a missing section, or a partial section
//! all work. Provider commands can additionally be overridden through
//! environment variables, which is how tests substitute stub binaries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Preview sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Build manifest the dev server requires (self-healed from the template).
    pub manifest_file: String,
    /// Dependency directory excluded from snapshots and preserved on restore.
    pub deps_dir: String,
    pub install_cmd: Vec<String>,
    pub serve_cmd: Vec<String>,
    /// Template copied into a workspace that lacks a build manifest.
    pub template_dir: Option<PathBuf>,
    /// Maximum live historical previews across all projects.
    pub historical_capacity: usize,
    pub ready_timeout_secs: u64,
    pub current_ttl_secs: u64,
    pub historical_ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            manifest_file: "package.json".to_string(),
            deps_dir: "node_modules".to_string(),
            install_cmd: vec!["npm".into(), "install".into()],
            serve_cmd: vec!["npm".into(), "run".into(), "dev".into()],
            template_dir: None,
            historical_capacity: 2,
            ready_timeout_secs: 120,
            current_ttl_secs: 1800,
            historical_ttl_secs: 600,
            reap_interval_secs: 60,
        }
    }
}

/// Defaults for run control; the pack manifest's `runDefaults` takes
/// precedence for threshold and iteration count.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub threshold: f64,
    pub max_iterations: u32,
    pub epsilon: f64,
    pub max_consecutive_rejections: u32,
    pub plateau_window: usize,
    pub plateau_threshold: f64,
    pub time_budget_secs: u64,
    pub layout_lock_threshold: f64,
    pub style_lock_threshold: f64,
    pub max_patch_targets: usize,
    pub preview_timeout_secs: u64,
    pub warmup_timeout_secs: u64,
    /// Pause after warm-up so in-place recompilation settles.
    pub settle_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            threshold: 0.92,
            max_iterations: 10,
            epsilon: 0.01,
            max_consecutive_rejections: 3,
            plateau_window: 3,
            plateau_threshold: 0.01,
            time_budget_secs: 900,
            layout_lock_threshold: 0.15,
            style_lock_threshold: 0.15,
            max_patch_targets: 3,
            preview_timeout_secs: 120,
            warmup_timeout_secs: 30,
            settle_ms: 1500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 4175,
            dev_mode: false,
        }
    }
}

/// Commands for the external providers. Each is argv-style; the first element
/// is the executable.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub codegen_cmd: Vec<String>,
    pub scorer_cmd: Vec<String>,
    pub probe_cmd: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            codegen_cmd: vec!["reify-codegen".into()],
            scorer_cmd: vec!["reify-score".into()],
            probe_cmd: vec!["reify-probe".into()],
        }
    }
}

/// Runtime configuration for the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub storage_dir: PathBuf,
    pub sandbox: SandboxSettings,
    pub run: RunSettings,
    pub server: ServerSettings,
    pub providers: ProviderSettings,
}

// ── Raw TOML structures for reify.toml ──────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct EngineToml {
    sandbox: Option<SandboxSection>,
    run: Option<RunSection>,
    server: Option<ServerSection>,
    providers: Option<ProvidersSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    manifest_file: Option<String>,
    deps_dir: Option<String>,
    install_cmd: Option<Vec<String>>,
    serve_cmd: Option<Vec<String>>,
    template_dir: Option<PathBuf>,
    historical_capacity: Option<usize>,
    ready_timeout_secs: Option<u64>,
    current_ttl_secs: Option<u64>,
    historical_ttl_secs: Option<u64>,
    reap_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RunSection {
    threshold: Option<f64>,
    max_iterations: Option<u32>,
    epsilon: Option<f64>,
    max_consecutive_rejections: Option<u32>,
    plateau_window: Option<usize>,
    plateau_threshold: Option<f64>,
    time_budget_secs: Option<u64>,
    layout_lock_threshold: Option<f64>,
    style_lock_threshold: Option<f64>,
    max_patch_targets: Option<usize>,
    preview_timeout_secs: Option<u64>,
    warmup_timeout_secs: Option<u64>,
    settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    port: Option<u16>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ProvidersSection {
    codegen_cmd: Option<Vec<String>>,
    scorer_cmd: Option<Vec<String>>,
    probe_cmd: Option<Vec<String>>,
}

impl EngineConfig {
    /// Load configuration for the given storage root.
    ///
    /// Reads `<storage_dir>/reify.toml` when present; otherwise everything is
    /// defaulted. `REIFY_CODEGEN_CMD`, `REIFY_SCORER_CMD` and
    /// `REIFY_PROBE_CMD` override the provider executables.
    pub fn load(storage_dir: &Path) -> Result<Self> {
        let mut config = Self {
            storage_dir: storage_dir.to_path_buf(),
            ..Self::default()
        };

        let config_path = storage_dir.join("reify.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let raw: EngineToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.apply(raw);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply(&mut self, raw: EngineToml) {
        if let Some(s) = raw.sandbox {
            let sb = &mut self.sandbox;
            if let Some(v) = s.manifest_file {
                sb.manifest_file = v;
            }
            if let Some(v) = s.deps_dir {
                sb.deps_dir = v;
            }
            if let Some(v) = s.install_cmd {
                sb.install_cmd = v;
            }
            if let Some(v) = s.serve_cmd {
                sb.serve_cmd = v;
            }
            if let Some(v) = s.template_dir {
                sb.template_dir = Some(v);
            }
            if let Some(v) = s.historical_capacity {
                sb.historical_capacity = v;
            }
            if let Some(v) = s.ready_timeout_secs {
                sb.ready_timeout_secs = v;
            }
            if let Some(v) = s.current_ttl_secs {
                sb.current_ttl_secs = v;
            }
            if let Some(v) = s.historical_ttl_secs {
                sb.historical_ttl_secs = v;
            }
            if let Some(v) = s.reap_interval_secs {
                sb.reap_interval_secs = v;
            }
        }
        if let Some(r) = raw.run {
            let rn = &mut self.run;
            if let Some(v) = r.threshold {
                rn.threshold = v;
            }
            if let Some(v) = r.max_iterations {
                rn.max_iterations = v;
            }
            if let Some(v) = r.epsilon {
                rn.epsilon = v;
            }
            if let Some(v) = r.max_consecutive_rejections {
                rn.max_consecutive_rejections = v;
            }
            if let Some(v) = r.plateau_window {
                rn.plateau_window = v;
            }
            if let Some(v) = r.plateau_threshold {
                rn.plateau_threshold = v;
            }
            if let Some(v) = r.time_budget_secs {
                rn.time_budget_secs = v;
            }
            if let Some(v) = r.layout_lock_threshold {
                rn.layout_lock_threshold = v;
            }
            if let Some(v) = r.style_lock_threshold {
                rn.style_lock_threshold = v;
            }
            if let Some(v) = r.max_patch_targets {
                rn.max_patch_targets = v;
            }
            if let Some(v) = r.preview_timeout_secs {
                rn.preview_timeout_secs = v;
            }
            if let Some(v) = r.warmup_timeout_secs {
                rn.warmup_timeout_secs = v;
            }
            if let Some(v) = r.settle_ms {
                rn.settle_ms = v;
            }
        }
        if let Some(s) = raw.server {
            if let Some(v) = s.port {
                self.server.port = v;
            }
            if let Some(v) = s.dev_mode {
                self.server.dev_mode = v;
            }
        }
        if let Some(p) = raw.providers {
            if let Some(v) = p.codegen_cmd {
                self.providers.codegen_cmd = v;
            }
            if let Some(v) = p.scorer_cmd {
                self.providers.scorer_cmd = v;
            }
            if let Some(v) = p.probe_cmd {
                self.providers.probe_cmd = v;
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(cmd) = std::env::var("REIFY_CODEGEN_CMD")
            && !cmd.is_empty()
        {
            self.providers.codegen_cmd = vec![cmd];
        }
        if let Ok(cmd) = std::env::var("REIFY_SCORER_CMD")
            && !cmd.is_empty()
        {
            self.providers.scorer_cmd = vec![cmd];
        }
        if let Ok(cmd) = std::env::var("REIFY_PROBE_CMD")
            && !cmd.is_empty()
        {
            self.providers.probe_cmd = vec![cmd];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.manifest_file, "package.json");
        assert_eq!(config.sandbox.historical_capacity, 2);
        assert_eq!(config.run.threshold, 0.92);
        assert_eq!(config.run.max_iterations, 10);
        assert_eq!(config.run.time_budget_secs, 900);
        assert_eq!(config.server.port, 4175);
    }

    #[test]
    fn test_load_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("reify.toml"),
            r#"
[sandbox]
historical_capacity = 4
serve_cmd = ["pnpm", "dev"]

[run]
threshold = 0.85
"#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.historical_capacity, 4);
        assert_eq!(config.sandbox.serve_cmd, vec!["pnpm", "dev"]);
        // untouched fields keep defaults
        assert_eq!(config.sandbox.deps_dir, "node_modules");
        assert_eq!(config.run.threshold, 0.85);
        assert_eq!(config.run.max_iterations, 10);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("reify.toml"), "not valid toml {{{{").unwrap();
        assert!(EngineConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_empty_sections_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("reify.toml"), "[sandbox]\n[run]\n[server]\n").unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.manifest_file, "package.json");
        assert_eq!(config.run.epsilon, 0.01);
        assert!(!config.server.dev_mode);
    }
}
