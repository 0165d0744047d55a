//! Trace event envelope and subscriber frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::score::ScoreVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    NodeCreated,
    NodeStarted,
    NodeProgress,
    NodeFinished,
    NodeFailed,
    ArtifactAdded,
}

/// An artifact attached to a trace node (a written file, a screenshot, a
/// report).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub kind: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Optional fields an event may carry; applied onto the node by the tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_best: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

/// Immutable record of one trace transition.
///
/// Events name their parent explicitly; node ids stay path-encoded strings
/// (`root-iter2-screenshot`) for readable artifacts and logs, but nothing
/// parses them back apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn new(
        project_id: &str,
        node_id: &str,
        parent_id: Option<&str>,
        event_type: EventType,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            pack_id: None,
            node_id: node_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            event_type,
            ts: Utc::now(),
            payload,
        }
    }

    pub fn with_pack(mut self, pack_id: &str) -> Self {
        self.pack_id = Some(pack_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Error,
}

/// Frames delivered to project-scoped subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    #[serde(rename = "agentEvent")]
    AgentEvent { event: AgentEvent },
    #[serde(rename = "runStarted")]
    RunStarted {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
    },
    #[serde(rename = "runFinished")]
    RunFinished {
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "projectId")]
        project_id: String,
        status: RunOutcome,
    },
    /// Error channel; also answers inbound `ping` frames with `"pong"`.
    #[serde(rename = "error")]
    Error { error: String },
}
