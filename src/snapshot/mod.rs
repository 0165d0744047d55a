//! Per-iteration workspace snapshots.
//!
//! Each snapshot is a `.tar.gz` of the workspace with the dependency
//! directory and build caches excluded, plus a JSON sidecar carrying the
//! iteration index and timestamp. Extraction into the runtime tree is
//! idempotent; restore replaces the workspace contents while leaving the
//! dependency directory untouched so a rollback never forces a reinstall.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::SnapshotError;
use crate::paths::ProjectPaths;

/// Build outputs that never belong in an archive, independent of the
/// configured dependency directory.
const BUILD_CACHE_DIRS: &[&str] = &[".next", ".turbo", ".cache", "dist"];

/// Sidecar metadata written next to each archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub archive_path: PathBuf,
}

/// Filesystem-backed snapshot store for one storage root.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    storage_dir: PathBuf,
    deps_dir: String,
}

impl SnapshotStore {
    pub fn new(storage_dir: &Path, deps_dir: &str) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            deps_dir: deps_dir.to_string(),
        }
    }

    fn paths(&self, project_id: &str) -> ProjectPaths {
        ProjectPaths::new(&self.storage_dir, project_id)
    }

    fn excluded(&self, name: &str) -> bool {
        name == self.deps_dir || BUILD_CACHE_DIRS.contains(&name)
    }

    /// Archive the workspace as the snapshot for `iteration`.
    pub async fn create(
        &self,
        project_id: &str,
        iteration: u32,
        workspace_dir: &Path,
    ) -> Result<SnapshotMeta, SnapshotError> {
        let store = self.clone();
        let workspace = workspace_dir.to_path_buf();
        let project = project_id.to_string();
        tokio::task::spawn_blocking(move || store.create_sync(&project, iteration, &workspace))
            .await
            .map_err(|e| SnapshotError::Other(anyhow::anyhow!("archive task panicked: {e}")))?
    }

    fn create_sync(
        &self,
        project_id: &str,
        iteration: u32,
        workspace_dir: &Path,
    ) -> Result<SnapshotMeta, SnapshotError> {
        let paths = self.paths(project_id);
        let archive_path = paths.snapshot_archive(iteration);
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent).map_err(|source| SnapshotError::ArchiveFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = fs::File::create(&archive_path).map_err(|source| {
            SnapshotError::ArchiveFailed {
                path: archive_path.clone(),
                source,
            }
        })?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for entry in WalkDir::new(workspace_dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.file_name()
                    .to_str()
                    .map(|name| !self.excluded(name))
                    .unwrap_or(true)
            })
        {
            let entry = entry.map_err(|e| {
                SnapshotError::Other(anyhow::anyhow!("workspace walk failed: {e}"))
            })?;
            let rel = entry
                .path()
                .strip_prefix(workspace_dir)
                .map_err(|e| SnapshotError::Other(anyhow::anyhow!(e)))?;
            let map_io = |source: std::io::Error| SnapshotError::ArchiveFailed {
                path: entry.path().to_path_buf(),
                source,
            };
            if entry.file_type().is_dir() {
                builder.append_dir(rel, entry.path()).map_err(map_io)?;
            } else if entry.file_type().is_file() {
                builder
                    .append_path_with_name(entry.path(), rel)
                    .map_err(map_io)?;
            }
        }

        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(|source| SnapshotError::ArchiveFailed {
                path: archive_path.clone(),
                source,
            })?;

        let meta = SnapshotMeta {
            iteration,
            created_at: Utc::now(),
            archive_path: archive_path.clone(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| SnapshotError::Other(e.into()))?;
        fs::write(paths.snapshot_meta(iteration), meta_json).map_err(|source| {
            SnapshotError::ArchiveFailed {
                path: paths.snapshot_meta(iteration),
                source,
            }
        })?;
        Ok(meta)
    }

    /// Extract a snapshot into its runtime directory, returning the extracted
    /// workspace path. Idempotent: an existing extraction is returned as-is.
    pub async fn extract(
        &self,
        project_id: &str,
        iteration: u32,
    ) -> Result<PathBuf, SnapshotError> {
        let store = self.clone();
        let project = project_id.to_string();
        tokio::task::spawn_blocking(move || store.extract_sync(&project, iteration))
            .await
            .map_err(|e| SnapshotError::Other(anyhow::anyhow!("extract task panicked: {e}")))?
    }

    fn extract_sync(&self, project_id: &str, iteration: u32) -> Result<PathBuf, SnapshotError> {
        let paths = self.paths(project_id);
        let runtime_ws = paths.runtime_workspace(iteration);
        if runtime_ws.is_dir() {
            return Ok(runtime_ws);
        }
        let archive_path = paths.snapshot_archive(iteration);
        if !archive_path.is_file() {
            return Err(SnapshotError::NotFound { iteration });
        }

        let map_io = |source: std::io::Error| SnapshotError::ExtractFailed { iteration, source };
        fs::create_dir_all(&runtime_ws).map_err(map_io)?;
        let file = fs::File::open(&archive_path).map_err(map_io)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.unpack(&runtime_ws).map_err(map_io)?;
        Ok(runtime_ws)
    }

    /// Metadata for every snapshot of a project, ascending by iteration.
    /// Corrupt sidecars are skipped.
    pub fn list(&self, project_id: &str) -> Vec<SnapshotMeta> {
        let dir = self.paths(project_id).snapshots_dir();
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut metas: Vec<SnapshotMeta> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let raw = fs::read_to_string(e.path()).ok()?;
                match serde_json::from_str::<SnapshotMeta>(&raw) {
                    Ok(meta) => Some(meta),
                    Err(err) => {
                        warn!(path = %e.path().display(), error = %err, "skipping corrupt snapshot metadata");
                        None
                    }
                }
            })
            .collect();
        metas.sort_by_key(|m| m.iteration);
        metas
    }

    pub fn has(&self, project_id: &str, iteration: u32) -> bool {
        self.paths(project_id).snapshot_archive(iteration).is_file()
    }

    /// Roll the workspace back to a snapshot. Everything under the workspace
    /// is replaced by the archived contents except the dependency directory.
    pub async fn restore(
        &self,
        project_id: &str,
        iteration: u32,
        workspace_dir: &Path,
    ) -> Result<(), SnapshotError> {
        let extracted = self.extract(project_id, iteration).await?;
        let store = self.clone();
        let workspace = workspace_dir.to_path_buf();
        tokio::task::spawn_blocking(move || store.overlay_sync(&extracted, &workspace))
            .await
            .map_err(|e| SnapshotError::Other(anyhow::anyhow!("restore task panicked: {e}")))?
    }

    fn overlay_sync(&self, extracted: &Path, workspace: &Path) -> Result<(), SnapshotError> {
        let wrap = |e: std::io::Error| SnapshotError::Other(anyhow::anyhow!(e));

        // Clear everything except the dependency directory.
        for entry in fs::read_dir(workspace).map_err(wrap)? {
            let entry = entry.map_err(wrap)?;
            let name = entry.file_name();
            if name.to_str() == Some(self.deps_dir.as_str()) {
                continue;
            }
            let path = entry.path();
            if entry.file_type().map_err(wrap)?.is_dir() {
                fs::remove_dir_all(&path).map_err(wrap)?;
            } else {
                fs::remove_file(&path).map_err(wrap)?;
            }
        }

        // Copy the archived tree back in. Archives never contain the
        // dependency directory, but guard anyway.
        for entry in fs::read_dir(extracted).map_err(wrap)? {
            let entry = entry.map_err(wrap)?;
            if entry.file_name().to_str() == Some(self.deps_dir.as_str()) {
                continue;
            }
            copy_recursive(&entry.path(), &workspace.join(entry.file_name())).map_err(wrap)?;
        }
        Ok(())
    }

    /// Remove the extracted runtime directory for an iteration.
    pub async fn cleanup(&self, project_id: &str, iteration: u32) -> Result<(), SnapshotError> {
        let dir = self.paths(project_id).runtime_dir(iteration);
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to remove runtime dir {}", dir.display()))?;
        }
        Ok(())
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
    }
    Ok(())
}
