//! Typed error hierarchy for the refinement engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `SandboxError` — preview install/spawn/readiness failures
//! - `SnapshotError` — workspace archive create/extract/restore failures
//! - `RunError` — orchestrator and provider failures

use thiserror::Error;

/// Errors from the preview sandbox subsystem.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no package manifest in workspace and no template configured")]
    NoManifest,

    #[error("dependency install failed with exit code {exit_code}: {stderr_tail}")]
    InstallFailed { exit_code: i32, stderr_tail: String },

    #[error("failed to spawn dev server: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("dev server exited before becoming ready (exit code {exit_code})")]
    ExitedBeforeReady { exit_code: i32 },

    #[error("dev server did not become ready within {timeout_secs}s")]
    ReadinessTimeout { timeout_secs: u64 },

    #[error("failed to allocate a preview port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot archive for iteration {iteration}")]
    NotFound { iteration: u32 },

    #[error("failed to archive workspace at {path}: {source}")]
    ArchiveFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract snapshot for iteration {iteration}: {source}")]
    ExtractFailed {
        iteration: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a run of the orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown project {0}")]
    UnknownProject(String),

    #[error("unknown design pack {0}")]
    UnknownPack(String),

    #[error("target {target_id} not present in pack manifest")]
    UnresolvableTarget { target_id: String },

    #[error("code generation produced no usable files")]
    EmptyGeneration,

    #[error("code generation provider failed: {0}")]
    CodeGen(String),

    #[error("preview failed: {0}")]
    Preview(String),

    #[error("every breakpoint capture failed")]
    AllCapturesFailed,

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
