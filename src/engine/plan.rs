//! Patch planning for the next iteration.
//!
//! After the first iteration the planner picks one scoring dimension to chase
//! (the one with the highest weighted error), ranks the unlocked IR nodes by
//! how much fixing them can move that dimension, and caps how much the
//! generator may change.

use serde::{Deserialize, Serialize};

use crate::engine::locks::LockManager;
use crate::engine::score::{
    A11Y_WEIGHT, LAYOUT_WEIGHT, PERCEPTUAL_WEIGHT, STYLE_WEIGHT, ScoreVector,
};
use crate::pack::ir::{IrNode, MatchImportance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusArea {
    Layout,
    Style,
    A11y,
    Perceptual,
}

impl FocusArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Style => "style",
            Self::A11y => "a11y",
            Self::Perceptual => "perceptual",
        }
    }
}

/// One node the next iteration should concentrate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTarget {
    pub node_id: String,
    pub name: String,
    pub severity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBudgets {
    pub max_files_changed: u32,
    pub max_lines_changed: u32,
    pub max_structure_changes: u32,
}

impl Default for PatchBudgets {
    fn default() -> Self {
        Self {
            max_files_changed: 2,
            max_lines_changed: 80,
            max_structure_changes: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPlan {
    pub focus_area: FocusArea,
    pub top_targets: Vec<PatchTarget>,
    pub budgets: PatchBudgets,
    pub disallowed_changes: Vec<String>,
    pub locked_node_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PatchPlanner {
    max_targets: usize,
    disallowed_changes: Vec<String>,
}

impl Default for PatchPlanner {
    fn default() -> Self {
        Self {
            max_targets: 3,
            disallowed_changes: vec![
                "routing".to_string(),
                "dependencies".to_string(),
                "global styles".to_string(),
            ],
        }
    }
}

impl PatchPlanner {
    pub fn new(max_targets: usize, disallowed_changes: Vec<String>) -> Self {
        Self {
            max_targets,
            disallowed_changes,
        }
    }

    pub fn with_max_targets(max_targets: usize) -> Self {
        Self {
            max_targets,
            ..Self::default()
        }
    }

    /// Build the plan for the iteration after `previous`.
    pub fn plan(
        &self,
        previous: &ScoreVector,
        nodes: &[IrNode],
        locks: &LockManager,
    ) -> PatchPlan {
        let focus_area = focus_area(previous);

        let mut targets: Vec<PatchTarget> = nodes
            .iter()
            .filter(|n| !locks.is_locked(&n.node_id))
            .map(|n| PatchTarget {
                node_id: n.node_id.clone(),
                name: n.name.clone(),
                severity: n.match_importance.weight() * relevance(focus_area, n),
            })
            .collect();
        targets.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        targets.truncate(self.max_targets);

        PatchPlan {
            focus_area,
            top_targets: targets,
            budgets: PatchBudgets::default(),
            disallowed_changes: self.disallowed_changes.clone(),
            locked_node_ids: locks.locked_ids(),
        }
    }
}

/// The dimension with the highest weighted error.
fn focus_area(scores: &ScoreVector) -> FocusArea {
    let candidates = [
        (FocusArea::Layout, LAYOUT_WEIGHT * (1.0 - scores.layout)),
        (FocusArea::Style, STYLE_WEIGHT * (1.0 - scores.style)),
        (FocusArea::A11y, A11Y_WEIGHT * (1.0 - scores.a11y)),
        (
            FocusArea::Perceptual,
            PERCEPTUAL_WEIGHT * (1.0 - scores.perceptual),
        ),
    ];
    candidates
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(area, _)| area)
        .unwrap_or(FocusArea::Layout)
}

/// How much a node matters for the chosen dimension.
fn relevance(focus: FocusArea, node: &IrNode) -> f64 {
    match focus {
        FocusArea::Layout => {
            if node.has_bbox() {
                1.0
            } else {
                0.3
            }
        }
        FocusArea::Style => (node.style_target_count() as f64 / 4.0).min(1.0),
        FocusArea::A11y => {
            if node.has_a11y_target() {
                1.0
            } else {
                0.2
            }
        }
        FocusArea::Perceptual => {
            if node.match_importance == MatchImportance::Critical {
                1.0
            } else {
                0.5
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::ir::tests::{node, node_with_targets};

    fn scores(layout: f64, style: f64, a11y: f64, perceptual: f64) -> ScoreVector {
        ScoreVector {
            layout,
            style,
            a11y,
            perceptual,
        }
    }

    #[test]
    fn test_focus_tracks_weighted_error() {
        // Layout error 0.3*0.4=0.12 beats style 0.3*0.1=0.03.
        assert_eq!(
            focus_area(&scores(0.6, 0.9, 1.0, 1.0)),
            FocusArea::Layout
        );
        // a11y error 0.2*1.0=0.2 beats layout 0.3*0.5=0.15.
        assert_eq!(focus_area(&scores(0.5, 1.0, 0.0, 1.0)), FocusArea::A11y);
        assert_eq!(
            focus_area(&scores(1.0, 1.0, 1.0, 0.2)),
            FocusArea::Perceptual
        );
    }

    #[test]
    fn test_plan_ranks_by_severity_and_caps() {
        let planner = PatchPlanner::default();
        let locks = LockManager::new(0.15, 0.15);
        let nodes = vec![
            node_with_targets("critical-boxed", MatchImportance::Critical, 2),
            node_with_targets("normal-boxed", MatchImportance::Normal, 2),
            node("critical-bare", MatchImportance::Critical),
            node("low-bare", MatchImportance::Low),
            node_with_targets("low-boxed", MatchImportance::Low, 1),
        ];
        // Layout focus: bbox → relevance 1.0, bare → 0.3.
        let plan = planner.plan(&scores(0.3, 1.0, 1.0, 1.0), &nodes, &locks);
        assert_eq!(plan.focus_area, FocusArea::Layout);
        assert_eq!(plan.top_targets.len(), 3);
        assert_eq!(plan.top_targets[0].node_id, "critical-boxed");
        assert_eq!(plan.top_targets[0].severity, 1.0);
        assert_eq!(plan.top_targets[1].node_id, "normal-boxed");
        assert_eq!(plan.top_targets[1].severity, 0.6);
        // critical-bare: 1.0 * 0.3 beats low-boxed 0.3 * 1.0 only on tie;
        // both are 0.3, order between them is not asserted.
        assert!(plan.top_targets[2].severity <= 0.6);
    }

    #[test]
    fn test_locked_nodes_are_excluded() {
        let planner = PatchPlanner::default();
        let mut locks = LockManager::new(0.15, 0.15);
        let nodes = vec![
            node_with_targets("hero", MatchImportance::Critical, 4),
            node_with_targets("nav", MatchImportance::Normal, 4),
        ];
        locks.update(&scores(0.95, 0.95, 0.5, 0.5), &nodes);
        assert!(locks.is_locked("hero"));

        let plan = planner.plan(&scores(0.9, 0.4, 1.0, 1.0), &nodes, &locks);
        assert_eq!(plan.focus_area, FocusArea::Style);
        assert_eq!(plan.top_targets.len(), 1);
        assert_eq!(plan.top_targets[0].node_id, "nav");
        assert_eq!(plan.locked_node_ids, vec!["hero"]);
    }

    #[test]
    fn test_style_relevance_scales_with_target_count() {
        let planner = PatchPlanner::default();
        let locks = LockManager::new(0.15, 0.15);
        let nodes = vec![
            node_with_targets("two-styles", MatchImportance::Normal, 2),
            node_with_targets("four-styles", MatchImportance::Normal, 4),
        ];
        let plan = planner.plan(&scores(1.0, 0.2, 1.0, 1.0), &nodes, &locks);
        assert_eq!(plan.top_targets[0].node_id, "four-styles");
        assert_eq!(plan.top_targets[0].severity, 0.6);
        assert_eq!(plan.top_targets[1].severity, 0.3);
    }

    #[test]
    fn test_default_budgets_and_disallowed() {
        let plan = PatchPlanner::default().plan(
            &scores(0.5, 0.5, 0.5, 0.5),
            &[],
            &LockManager::new(0.15, 0.15),
        );
        assert_eq!(plan.budgets, PatchBudgets::default());
        assert_eq!(plan.budgets.max_files_changed, 2);
        assert_eq!(plan.budgets.max_lines_changed, 80);
        assert_eq!(plan.budgets.max_structure_changes, 1);
        assert_eq!(
            plan.disallowed_changes,
            vec!["routing", "dependencies", "global styles"]
        );
        assert!(plan.top_targets.is_empty());
    }
}
