//! Stage graph runtime
//!
//! This module provides the live graph the motion orchestrator mutates,
//! separating concerns between:
//! - Structure: the stage arena, links and caps negotiation ([`graph`])
//! - Data transport: the data loop pushing frames through a published
//!   topology ([`flow`])
//! - Control plane: events posted by stages onto the bus ([`event`])
//! - Descriptions: launch-line parsing and element factories
//!
//! # Threads
//!
//! The graph itself is only touched from the control task. One data task per
//! started graph pulls from the source and walks frames depth first through
//! an immutable [`graph::Topology`]. Run state requests are acknowledged by the
//! data task between frames, so a completed `Paused` transition means nothing
//! is in flight and the topology may be edited and republished.

pub mod barrier;
pub mod describe;
pub mod event;
mod flow;
pub mod graph;
pub mod health;
pub mod registry;
pub mod stage;
pub mod state;
pub mod types;

pub use barrier::{DrainBarrier, DrainBarrierState, Verdict};
pub use event::{Bus, ControlEvent, ErrorCode};
pub use graph::{LinkId, StageGraph, StageId, Subgraph};
pub use health::{FlowStats, FlowSummary};
pub use registry::StageRegistry;
pub use stage::{Element, Flow, Source, Stage, StageContext};
pub use state::{RunState, StateChange};
pub use types::{Caps, Frame, Timestamp};
