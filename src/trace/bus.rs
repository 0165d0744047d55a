//! Fan-out of run progress to project-scoped subscribers.
//!
//! Each project has a frame buffer for the run in flight, a broadcast
//! channel for live delivery, and the derived trace tree. Subscribing
//! snapshots the buffer and opens a receiver under the same lock, so a late
//! subscriber sees every frame exactly once, in production order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::event::{AgentEvent, RunOutcome, StreamFrame};
use super::tree::{TraceNode, TraceTree};

const CHANNEL_CAPACITY: usize = 256;

struct ProjectChannel {
    buffer: Vec<StreamFrame>,
    tx: broadcast::Sender<StreamFrame>,
    tree: TraceTree,
}

impl ProjectChannel {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            buffer: Vec::new(),
            tx,
            tree: TraceTree::new("run"),
        }
    }

    fn push(&mut self, frame: StreamFrame) {
        self.buffer.push(frame.clone());
        // No receivers is fine; the buffer still serves late subscribers.
        let _ = self.tx.send(frame);
    }
}

/// The fan-out point between one producing run and many observers.
#[derive(Clone)]
pub struct TraceBus {
    channels: Arc<Mutex<HashMap<String, ProjectChannel>>>,
}

impl Default for TraceBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Announce a new run. Resets the project's buffer and tree; the frame is
    /// delivered before any event of the run.
    pub fn run_started(&self, project_id: &str, run_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(project_id.to_string())
            .or_insert_with(ProjectChannel::new);
        channel.buffer.clear();
        channel.tree = TraceTree::new(run_id);
        channel.push(StreamFrame::RunStarted {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
        });
    }

    /// Publish one trace event: applied to the tree, buffered, broadcast.
    pub fn publish(&self, event: AgentEvent) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(event.project_id.clone())
            .or_insert_with(ProjectChannel::new);
        channel.tree.apply(&event);
        debug!(node = %event.node_id, event = ?event.event_type, "trace event");
        channel.push(StreamFrame::AgentEvent { event });
    }

    /// Announce run completion. Delivered after the run's last event.
    pub fn run_finished(&self, project_id: &str, run_id: &str, status: RunOutcome) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(project_id.to_string())
            .or_insert_with(ProjectChannel::new);
        channel.push(StreamFrame::RunFinished {
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            status,
        });
    }

    /// Open a subscription: the buffered frames so far plus a live receiver.
    /// Both come from the same locked section, so nothing is missed or
    /// duplicated in between.
    pub fn subscribe(&self, project_id: &str) -> (Vec<StreamFrame>, broadcast::Receiver<StreamFrame>) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels
            .entry(project_id.to_string())
            .or_insert_with(ProjectChannel::new);
        (channel.buffer.clone(), channel.tx.subscribe())
    }

    /// Serialized copy of the project's current trace tree.
    pub fn tree(&self, project_id: &str) -> Option<TraceNode> {
        let channels = self.channels.lock().unwrap();
        channels.get(project_id).map(|c| c.tree.root.clone())
    }

    pub fn best_iteration_index(&self, project_id: &str) -> Option<u32> {
        let channels = self.channels.lock().unwrap();
        channels.get(project_id)?.tree.best_iteration_index()
    }
}
