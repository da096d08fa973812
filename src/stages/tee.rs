use crate::error::Result;
use crate::pipeline::stage::{Flow, Stage, StageContext};
use crate::pipeline::types::Frame;

/// Fan-out junction: every output link gets its own handle on each frame.
#[derive(Default)]
pub struct Tee {
    forwarded: u64,
}

impl Tee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

impl Stage for Tee {
    fn kind(&self) -> &'static str {
        "tee"
    }

    fn process(&mut self, frame: Frame, _ctx: &StageContext<'_>) -> Result<Flow> {
        self.forwarded += 1;
        Ok(Flow::Forward(frame))
    }

    fn is_junction(&self) -> bool {
        true
    }
}
