//! Filesystem layout under the storage root.
//!
//! Every path is keyed by project, run, and iteration ids, so artifact,
//! snapshot, and runtime trees are disjoint by construction.

use std::path::{Path, PathBuf};

/// Path construction for one project's on-disk tree.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(storage_dir: &Path, project_id: &str) -> Self {
        Self {
            root: storage_dir.join("projects").join(project_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_meta(&self) -> PathBuf {
        self.root.join("project.json")
    }

    /// The mutable workspace the run writes generated code into.
    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn pack_dir(&self, pack_id: &str) -> PathBuf {
        self.root.join("artifacts").join("design-packs").join(pack_id)
    }

    pub fn pack_manifest(&self, pack_id: &str) -> PathBuf {
        self.pack_dir(pack_id).join("manifest.json")
    }

    pub fn pack_ir(&self, pack_id: &str) -> PathBuf {
        self.pack_dir(pack_id).join("design-ir.json")
    }

    pub fn baseline(
        &self,
        pack_id: &str,
        target_id: &str,
        breakpoint_id: &str,
        state_id: &str,
    ) -> PathBuf {
        self.pack_dir(pack_id)
            .join("baselines")
            .join(target_id)
            .join(breakpoint_id)
            .join(format!("{state_id}.png"))
    }

    pub fn run_shots_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("artifacts").join("snapshots").join(run_id)
    }

    pub fn screenshot(&self, run_id: &str, breakpoint_id: &str) -> PathBuf {
        self.run_shots_dir(run_id).join(format!("{breakpoint_id}.png"))
    }

    pub fn overflow_report(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.run_shots_dir(run_id)
            .join(format!("iter-{iteration}-overflow.json"))
    }

    pub fn snapshot_archive(&self, iteration: u32) -> PathBuf {
        self.root.join("snapshots").join(format!("iter-{iteration}.tar.gz"))
    }

    pub fn snapshot_meta(&self, iteration: u32) -> PathBuf {
        self.root.join("snapshots").join(format!("iter-{iteration}.json"))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Extraction target for a historical preview of one iteration.
    pub fn runtime_workspace(&self, iteration: u32) -> PathBuf {
        self.root
            .join("runtime")
            .join(format!("iter-{iteration}"))
            .join("workspace")
    }

    pub fn runtime_dir(&self, iteration: u32) -> PathBuf {
        self.root.join("runtime").join(format!("iter-{iteration}"))
    }
}
