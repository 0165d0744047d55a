//! Design-pack manifest: targets, breakpoints, states, and run defaults.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    pub schema_version: String,
    pub project_name: String,
    pub targets: Vec<Target>,
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub states: Vec<PageState>,
    pub run_defaults: RunDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: String,
    pub route: String,
    pub entry: TargetEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file_hint: Option<String>,
}

/// A viewport configuration screenshots and scoring run at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub breakpoint_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale_factor")]
    pub device_scale_factor: f64,
}

fn default_scale_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    pub state_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDefaults {
    pub target_id: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_threshold() -> f64 {
    0.92
}

fn default_max_iterations() -> u32 {
    10
}

impl PackManifest {
    /// Parse and validate a manifest. The default run target must exist and
    /// at least one breakpoint must be declared.
    pub fn parse(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.breakpoints.is_empty() {
            bail!("manifest declares no breakpoints");
        }
        if self.target(&self.run_defaults.target_id).is_none() {
            bail!(
                "runDefaults.targetId '{}' not among manifest targets",
                self.run_defaults.target_id
            );
        }
        Ok(())
    }

    pub fn target(&self, target_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.target_id == target_id)
    }

    /// The breakpoint overflow inspection runs at: the first declared one.
    pub fn primary_breakpoint(&self) -> &Breakpoint {
        &self.breakpoints[0]
    }

    /// State used for baseline lookup when a pack declares none.
    pub fn default_state_id(&self) -> &str {
        self.states
            .first()
            .map(|s| s.state_id.as_str())
            .unwrap_or("default")
    }
}
