//! Motion camera orchestration
//!
//! Builds the backbone graph, attaches and detaches output branches at its
//! junction while it runs, and turns analysis events into application-facing
//! domain events.

pub mod beacon;
pub mod branches;
pub mod orchestrator;
pub mod policy;
pub mod router;
pub mod topology;

pub use beacon::{Beacon, DomainEvent, EventKind, Watcher, watcher};
pub use orchestrator::{Command, Motion, MotionState, Status, WeakMotion};
pub use router::EventRouter;
pub use topology::{BranchHandle, TopologyController};
