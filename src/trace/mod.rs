//! Run progress as a growing tree of step nodes, fanned out to subscribers.

mod bus;
mod event;
mod tree;

pub use bus::TraceBus;
pub use event::{AgentEvent, Artifact, EventPayload, EventType, RunOutcome, StreamFrame};
pub use tree::{NodeStatus, ROOT_NODE_ID, TraceNode, TraceTree};
