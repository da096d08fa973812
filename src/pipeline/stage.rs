//! Stage traits
//!
//! Defines the interface the graph uses to drive opaque processing units.
//! Concrete computations (decoders, encoders, analysis) live behind these
//! traits and are created by a [`StageRegistry`](super::registry::StageRegistry).

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::event::{Bus, ControlEvent, ErrorCode};
use super::state::RunState;
use super::types::{Caps, Frame};
use crate::error::Result;

/// What a stage did with a frame
#[derive(Debug)]
pub enum Flow {
    /// Hand the (possibly transformed) frame to every downstream link
    Forward(Frame),
    /// The frame ended here
    Consumed,
}

/// Per-call view a stage gets of the graph while processing.
pub struct StageContext<'a> {
    name: &'a str,
    bus: &'a Bus,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(name: &'a str, bus: &'a Bus) -> Self {
        Self { name, bus }
    }

    /// Name of the stage being driven
    pub fn name(&self) -> &str {
        self.name
    }

    /// Post an element event carrying `fields`, sourced from this stage
    pub fn post_element(&self, fields: Map<String, Value>) {
        self.bus.post(ControlEvent::element(self.name, fields));
    }

    pub fn post_error(&self, code: ErrorCode, message: impl std::fmt::Display) {
        self.bus
            .post(ControlEvent::error(code, format!("{}: {}", self.name, message)));
    }
}

/// A processing unit with one input and one (or, for junctions, many) outputs.
///
/// `process` runs on the data thread. `change_state` runs on the control
/// thread while data flow is held, so the two never overlap.
pub trait Stage: Send {
    /// Element kind, for logging
    fn kind(&self) -> &'static str;

    /// Process a single frame
    fn process(&mut self, frame: Frame, ctx: &StageContext<'_>) -> Result<Flow>;

    /// Move between adjacent run states. Sinks open their resources on
    /// `Stopped -> Paused` and release them on `Paused -> Stopped`.
    fn change_state(&mut self, _from: RunState, _to: RunState) -> Result<()> {
        Ok(())
    }

    /// Whether an upstream link carrying `caps` may be connected
    fn accepts(&self, _caps: &Caps) -> bool {
        true
    }

    /// Caps produced on the output; `Caps::any()` means "same as input"
    fn output_caps(&self) -> Caps {
        Caps::any()
    }

    /// Junctions may have any number of output links
    fn is_junction(&self) -> bool {
        false
    }
}

/// Head of the backbone: produces frames, has no input.
#[async_trait]
pub trait Source: Send {
    fn kind(&self) -> &'static str;

    /// Produce the next frame; `None` means end of stream.
    ///
    /// Must be cancel safe: the data loop abandons the future whenever a run
    /// state change arrives and calls again later.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    fn output_caps(&self) -> Caps {
        Caps::any()
    }
}

/// An instantiated element, before it is added to a graph
pub enum Element {
    Source(Box<dyn Source>),
    Stage(Box<dyn Stage>),
}

impl Element {
    pub fn kind(&self) -> &'static str {
        match self {
            Element::Source(source) => source.kind(),
            Element::Stage(stage) => stage.kind(),
        }
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Element::Source(s) => write!(f, "Source({})", s.kind()),
            Element::Stage(s) => write!(f, "Stage({})", s.kind()),
        }
    }
}
