//! Frozen-node bookkeeping.
//!
//! Once layout and style both sit close enough to the design, critical nodes
//! that carry full targets are locked so later iterations stop churning them.
//! The set only grows within a run.

use std::collections::BTreeSet;

use crate::engine::score::ScoreVector;
use crate::pack::ir::{IrNode, MatchImportance};

#[derive(Debug, Clone)]
pub struct LockManager {
    layout_threshold: f64,
    style_threshold: f64,
    locked: BTreeSet<String>,
}

impl LockManager {
    pub fn new(layout_threshold: f64, style_threshold: f64) -> Self {
        Self {
            layout_threshold,
            style_threshold,
            locked: BTreeSet::new(),
        }
    }

    pub fn is_locked(&self, node_id: &str) -> bool {
        self.locked.contains(node_id)
    }

    pub fn locked_ids(&self) -> Vec<String> {
        self.locked.iter().cloned().collect()
    }

    /// Grow the lock set from the latest aggregate scores. Returns the node
    /// ids locked by this pass.
    pub fn update(&mut self, aggregate: &ScoreVector, nodes: &[IrNode]) -> Vec<String> {
        let close_enough = 1.0 - aggregate.layout <= self.layout_threshold
            && 1.0 - aggregate.style <= self.style_threshold;
        if !close_enough {
            return Vec::new();
        }

        let mut newly_locked = Vec::new();
        for node in nodes {
            if node.match_importance == MatchImportance::Critical
                && node.has_bbox()
                && node.style_target_count() > 0
                && self.locked.insert(node.node_id.clone())
            {
                newly_locked.push(node.node_id.clone());
            }
        }
        newly_locked
    }
}
