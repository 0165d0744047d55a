//! Iterative design-to-code refinement engine.
//!
//! ## Overview
//!
//! A design pack (manifest + design IR + baseline screenshots) goes in; an
//! implemented page comes out. The engine runs a closed loop per project:
//! generate code, render it in a live dev-server sandbox, screenshot it at
//! each breakpoint, score the screenshots against the baselines, then accept,
//! reject, or stop.
//!
//! ## Module Map
//!
//! ```text
//! engine::Engine ── start_run() ──> engine::orchestrator::RunOrchestrator
//!     │                                 │ codegen   (providers + codegen.rs)
//!     │                                 │ preview   (sandbox::SandboxManager)
//!     │                                 │ capture   (providers::PageProbe)
//!     │                                 │ score     (providers::VisionScorer)
//!     │                                 │ decide    (score / locks / plan / stop)
//!     │                                 └ snapshot  (snapshot::SnapshotStore)
//!     │
//!     └─ trace::TraceBus ──> server.rs (/ws/{project_id} subscribers)
//! ```
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `sandbox`  | Dev-server pools: spawn, readiness, LRU, reaping, kill  |
//! | `snapshot` | Per-iteration workspace archives, rollback restore      |
//! | `engine`   | Run registry, orchestrator, decision logic, providers   |
//! | `trace`    | Event envelope, derived tree, buffered fan-out          |
//! | `pack`     | Design-pack manifest and IR models                      |
//! | `server`   | Subscribe WebSocket + health endpoint                   |

pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod pack;
pub mod paths;
pub mod sandbox;
pub mod server;
pub mod snapshot;
pub mod trace;
