//! Preview sandbox lifecycle.
//!
//! ```text
//! SandboxManager
//!   ├─ current[project]              one live dev server per project
//!   └─ historical[(project, iter)]   bounded pool, LRU-evicted
//!        │
//!        └─ process.rs: port allocation, env scrubbing, setsid spawn,
//!           ready-sentinel watch, SIGTERM→SIGKILL group termination
//! ```
//!
//! The manager is the sole mutator of both pools; a single async mutex makes
//! pool operations atomic with respect to each other. Startup runs detached
//! and reports back through the entry; idle previews are reaped on a timer.

mod manager;
mod process;

pub use manager::{PreviewInfo, PreviewStatus, SandboxManager};
