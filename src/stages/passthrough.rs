use crate::error::Result;
use crate::pipeline::stage::{Flow, Stage, StageContext};
use crate::pipeline::types::{Caps, Frame};

/// Forwards every frame untouched. Used for queues, converters, encoders
/// (advertising their output type) and caps filters.
pub struct Passthrough {
    kind: &'static str,
    caps: Caps,
    filter: bool,
}

impl Passthrough {
    pub fn new(kind: &'static str, caps: Caps) -> Self {
        Self {
            kind,
            caps,
            filter: false,
        }
    }

    /// A caps filter only accepts upstream caps compatible with its own
    pub fn filter(caps: Caps) -> Self {
        Self {
            kind: "capsfilter",
            caps,
            filter: true,
        }
    }
}

impl Stage for Passthrough {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn process(&mut self, frame: Frame, _ctx: &StageContext<'_>) -> Result<Flow> {
        Ok(Flow::Forward(frame))
    }

    fn accepts(&self, caps: &Caps) -> bool {
        !self.filter || self.caps.can_intersect(caps)
    }

    fn output_caps(&self) -> Caps {
        self.caps.clone()
    }
}
