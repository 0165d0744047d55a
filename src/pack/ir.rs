//! Design IR: the flat node list the planner and lock manager reason over.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignIr {
    pub schema_version: String,
    pub targets: Vec<IrTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrTarget {
    pub target_id: String,
    pub nodes: Vec<IrNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchImportance {
    Critical,
    Normal,
    Low,
}

impl MatchImportance {
    /// Weight used when ranking patch targets.
    pub fn weight(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::Normal => 0.6,
            Self::Low => 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrNode {
    pub node_id: String,
    pub name: String,
    pub match_importance: MatchImportance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_mapping: Option<ComponentMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_targets: Option<LayoutTargets>,
    /// Property name → expected value; colors are `rgb(r,g,b)` strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_targets: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a11y_targets: Option<A11yTargets>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMapping {
    pub component: String,
    #[serde(default)]
    pub props: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutTargets {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub tolerance_px: TolerancePx,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TolerancePx {
    #[serde(default = "default_pos_tolerance")]
    pub x: f64,
    #[serde(default = "default_pos_tolerance")]
    pub y: f64,
    #[serde(default = "default_size_tolerance")]
    pub w: f64,
    #[serde(default = "default_size_tolerance")]
    pub h: f64,
}

fn default_pos_tolerance() -> f64 {
    8.0
}

fn default_size_tolerance() -> f64 {
    10.0
}

impl Default for TolerancePx {
    fn default() -> Self {
        Self {
            x: 8.0,
            y: 8.0,
            w: 10.0,
            h: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct A11yTargets {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labelled_by_node_id: Option<String>,
}

impl IrNode {
    pub fn has_bbox(&self) -> bool {
        self.layout_targets.is_some()
    }

    pub fn style_target_count(&self) -> usize {
        self.style_targets.as_ref().map_or(0, |s| s.len())
    }

    pub fn has_a11y_target(&self) -> bool {
        self.a11y_targets.as_ref().is_some_and(|a| {
            a.role.is_some() || a.name.is_some() || a.labelled_by_node_id.is_some()
        })
    }
}

impl DesignIr {
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn nodes_for(&self, target_id: &str) -> &[IrNode] {
        self.targets
            .iter()
            .find(|t| t.target_id == target_id)
            .map(|t| t.nodes.as_slice())
            .unwrap_or(&[])
    }
}
