//! The growing tree of step nodes a run's events describe.
//!
//! Events are applied in arrival order. A node is created on the first
//! `nodeCreated`/`nodeStarted` for its id, attached under the parent the
//! event names (the root when it names none); later events mutate fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::score::ScoreVector;

use super::event::{AgentEvent, Artifact, EventType};

pub const ROOT_NODE_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl NodeStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    pub title: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default)]
    pub is_best: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_area: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn new(id: &str, title: String) -> Self {
        Self {
            id: id.to_string(),
            step_key: None,
            title,
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            message: None,
            score: None,
            decision: None,
            is_best: false,
            focus_area: None,
            artifacts: Vec::new(),
            children: Vec::new(),
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut TraceNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceTree {
    pub root: TraceNode,
}

impl TraceTree {
    pub fn new(title: &str) -> Self {
        let mut root = TraceNode::new(ROOT_NODE_ID, title.to_string());
        root.status = NodeStatus::Running;
        root.started_at = Some(Utc::now());
        Self { root }
    }

    pub fn find(&self, id: &str) -> Option<&TraceNode> {
        fn walk<'a>(node: &'a TraceNode, id: &str) -> Option<&'a TraceNode> {
            if node.id == id {
                return Some(node);
            }
            node.children.iter().find_map(|c| walk(c, id))
        }
        walk(&self.root, id)
    }

    /// Apply one event. Unknown node ids on non-creating events are ignored;
    /// a missing parent attaches the new node to the root.
    pub fn apply(&mut self, event: &AgentEvent) {
        if self.root.find_mut(&event.node_id).is_none() {
            if !matches!(
                event.event_type,
                EventType::NodeCreated | EventType::NodeStarted
            ) {
                return;
            }
            let title = event
                .payload
                .title
                .clone()
                .unwrap_or_else(|| event.node_id.clone());
            let mut node = TraceNode::new(&event.node_id, title);
            node.step_key = event.payload.step_key.clone();
            // Unknown parents keep the node visible at the root.
            let parent_id = event.parent_id.as_deref().unwrap_or(ROOT_NODE_ID);
            let target = if self.root.find_mut(parent_id).is_some() {
                parent_id
            } else {
                ROOT_NODE_ID
            };
            if let Some(parent) = self.root.find_mut(target) {
                parent.children.push(node);
            }
        }

        let Some(node) = self.root.find_mut(&event.node_id) else {
            return;
        };
        let payload = &event.payload;
        match event.event_type {
            EventType::NodeCreated => {}
            EventType::NodeStarted => {
                node.status = NodeStatus::Running;
                node.started_at = Some(event.ts);
                if let Some(title) = &payload.title {
                    node.title = title.clone();
                }
            }
            EventType::NodeProgress => {
                if let Some(message) = &payload.message {
                    node.message = Some(message.clone());
                }
                if let Some(focus) = &payload.focus_area {
                    node.focus_area = Some(focus.clone());
                }
            }
            EventType::NodeFinished => {
                node.status = payload
                    .status
                    .as_deref()
                    .and_then(NodeStatus::parse)
                    .unwrap_or(NodeStatus::Success);
                node.finished_at = Some(event.ts);
                if let Some(message) = &payload.message {
                    node.message = Some(message.clone());
                }
                if let Some(score) = payload.score {
                    node.score = Some(score);
                }
            }
            EventType::NodeFailed => {
                node.status = NodeStatus::Error;
                node.finished_at = Some(event.ts);
                if let Some(message) = &payload.message {
                    node.message = Some(message.clone());
                }
            }
            EventType::ArtifactAdded => {
                if let Some(artifact) = &payload.artifact {
                    node.artifacts.push(artifact.clone());
                }
            }
        }
        if let Some(decision) = &payload.decision {
            node.decision = Some(decision.clone());
        }
        if let Some(is_best) = payload.is_best {
            node.is_best = is_best;
        }
    }

    /// Index of the iteration currently flagged best, scanning the root's
    /// iteration children in order.
    pub fn best_iteration_index(&self) -> Option<u32> {
        self.root
            .children
            .iter()
            .filter(|c| c.step_key.as_deref() == Some("iteration"))
            .position(|c| c.is_best)
            .map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::EventPayload;

    fn event(
        node_id: &str,
        parent_id: Option<&str>,
        event_type: EventType,
        payload: EventPayload,
    ) -> AgentEvent {
        AgentEvent::new("p1", node_id, parent_id, event_type, payload)
    }

    fn iteration_payload() -> EventPayload {
        EventPayload {
            step_key: Some("iteration".to_string()),
            ..EventPayload::default()
        }
    }

    #[test]
    fn test_started_creates_and_marks_running() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "root-iter0",
            Some(ROOT_NODE_ID),
            EventType::NodeStarted,
            EventPayload {
                title: Some("Iteration 0".to_string()),
                ..iteration_payload()
            },
        ));
        let node = tree.find("root-iter0").unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.title, "Iteration 0");
        assert!(node.started_at.is_some());
    }

    #[test]
    fn test_children_attach_under_named_parent() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "root-iter0",
            Some(ROOT_NODE_ID),
            EventType::NodeStarted,
            iteration_payload(),
        ));
        tree.apply(&event(
            "root-iter0-codegen",
            Some("root-iter0"),
            EventType::NodeStarted,
            EventPayload::default(),
        ));
        let iter = tree.find("root-iter0").unwrap();
        assert_eq!(iter.children.len(), 1);
        assert_eq!(iter.children[0].id, "root-iter0-codegen");
    }

    #[test]
    fn test_missing_parent_falls_back_to_root() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "orphan",
            Some("never-created"),
            EventType::NodeCreated,
            EventPayload::default(),
        ));
        assert_eq!(tree.root.children.len(), 1);
        assert_eq!(tree.root.children[0].id, "orphan");
        assert_eq!(tree.root.children[0].status, NodeStatus::Pending);
    }

    #[test]
    fn test_finished_defaults_to_success_and_carries_score() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "n",
            None,
            EventType::NodeStarted,
            EventPayload::default(),
        ));
        tree.apply(&event(
            "n",
            None,
            EventType::NodeFinished,
            EventPayload {
                score: Some(ScoreVector::neutral()),
                ..EventPayload::default()
            },
        ));
        let node = tree.find("n").unwrap();
        assert_eq!(node.status, NodeStatus::Success);
        assert!(node.finished_at.is_some());
        assert_eq!(node.score, Some(ScoreVector::neutral()));
    }

    #[test]
    fn test_failed_sets_error_and_message() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "n",
            None,
            EventType::NodeStarted,
            EventPayload::default(),
        ));
        tree.apply(&event(
            "n",
            None,
            EventType::NodeFailed,
            EventPayload {
                message: Some("install exploded".to_string()),
                ..EventPayload::default()
            },
        ));
        let node = tree.find("n").unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.message.as_deref(), Some("install exploded"));
    }

    #[test]
    fn test_progress_and_artifacts_accumulate() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "n",
            None,
            EventType::NodeStarted,
            EventPayload::default(),
        ));
        tree.apply(&event(
            "n",
            None,
            EventType::NodeProgress,
            EventPayload {
                message: Some("warming route".to_string()),
                focus_area: Some("layout".to_string()),
                ..EventPayload::default()
            },
        ));
        for label in ["a.tsx", "b.tsx"] {
            tree.apply(&event(
                "n",
                None,
                EventType::ArtifactAdded,
                EventPayload {
                    artifact: Some(Artifact {
                        kind: "file".to_string(),
                        label: label.to_string(),
                        path: None,
                        size_bytes: None,
                    }),
                    ..EventPayload::default()
                },
            ));
        }
        let node = tree.find("n").unwrap();
        assert_eq!(node.message.as_deref(), Some("warming route"));
        assert_eq!(node.focus_area.as_deref(), Some("layout"));
        assert_eq!(node.artifacts.len(), 2);
    }

    #[test]
    fn test_mutating_event_for_unknown_node_is_ignored() {
        let mut tree = TraceTree::new("run");
        tree.apply(&event(
            "ghost",
            None,
            EventType::NodeFinished,
            EventPayload::default(),
        ));
        assert!(tree.find("ghost").is_none());
        assert!(tree.root.children.is_empty());
    }

    #[test]
    fn test_best_index_migrates() {
        let mut tree = TraceTree::new("run");
        for i in 0..3 {
            tree.apply(&event(
                &format!("root-iter{i}"),
                Some(ROOT_NODE_ID),
                EventType::NodeStarted,
                iteration_payload(),
            ));
        }
        tree.apply(&event(
            "root-iter0",
            None,
            EventType::NodeFinished,
            EventPayload {
                is_best: Some(true),
                ..EventPayload::default()
            },
        ));
        assert_eq!(tree.best_iteration_index(), Some(0));

        // Best migrates: the old holder is cleared, the new one set.
        tree.apply(&event(
            "root-iter0",
            None,
            EventType::NodeProgress,
            EventPayload {
                is_best: Some(false),
                ..EventPayload::default()
            },
        ));
        tree.apply(&event(
            "root-iter2",
            None,
            EventType::NodeFinished,
            EventPayload {
                is_best: Some(true),
                ..EventPayload::default()
            },
        ));
        assert_eq!(tree.best_iteration_index(), Some(2));

        let best_flags: Vec<bool> = tree.root.children.iter().map(|c| c.is_best).collect();
        assert_eq!(best_flags.iter().filter(|b| **b).count(), 1);
    }
}
