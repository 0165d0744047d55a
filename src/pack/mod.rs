//! Design pack loading.
//!
//! A pack is an immutable bundle extracted by the upload pipeline:
//! `manifest.json`, `design-ir.json`, and baseline PNGs keyed by
//! `(targetId, breakpointId, stateId)`. The engine only reads it.

pub mod ir;
pub mod manifest;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::errors::RunError;
use crate::paths::ProjectPaths;

pub use ir::{DesignIr, IrNode, MatchImportance};
pub use manifest::{Breakpoint, PackManifest, RunDefaults, Target};

/// A loaded design pack.
#[derive(Debug, Clone)]
pub struct DesignPack {
    pub pack_id: String,
    pub manifest: PackManifest,
    pub ir: DesignIr,
    baselines_root: PathBuf,
}

impl DesignPack {
    /// Load a pack from a project's artifact tree.
    pub async fn load(paths: &ProjectPaths, pack_id: &str) -> Result<Self, RunError> {
        let pack_dir = paths.pack_dir(pack_id);
        if !pack_dir.is_dir() {
            return Err(RunError::UnknownPack(pack_id.to_string()));
        }

        let manifest_raw = tokio::fs::read_to_string(paths.pack_manifest(pack_id))
            .await
            .with_context(|| format!("Failed to read manifest for pack {pack_id}"))?;
        let manifest = PackManifest::parse(&manifest_raw)?;

        let ir_raw = tokio::fs::read_to_string(paths.pack_ir(pack_id))
            .await
            .with_context(|| format!("Failed to read design IR for pack {pack_id}"))?;
        let ir = DesignIr::parse(&ir_raw)?;

        Ok(Self {
            pack_id: pack_id.to_string(),
            manifest,
            ir,
            baselines_root: pack_dir.join("baselines"),
        })
    }

    /// Resolve the target the run renders, checking it exists in the manifest.
    pub fn resolve_target(&self, target_id: &str) -> Result<&Target, RunError> {
        self.manifest
            .target(target_id)
            .ok_or_else(|| RunError::UnresolvableTarget {
                target_id: target_id.to_string(),
            })
    }

    /// Baseline screenshot path for one `(target, breakpoint, state)` key.
    pub fn baseline_path(&self, target_id: &str, breakpoint_id: &str, state_id: &str) -> PathBuf {
        self.baselines_root
            .join(target_id)
            .join(breakpoint_id)
            .join(format!("{state_id}.png"))
    }
}
