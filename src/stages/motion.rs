//! Frame-change motion analysis
//!
//! Compares each frame against the previous one and reports the start and end
//! of movement as element events on the bus:
//!
//! - `motion_begin` when the share of changed pixels first reaches
//!   `sensitivity`
//! - `motion_finished` once no movement has been seen for `gap` seconds of
//!   stream time
//!
//! Both carry the frame timestamp in microseconds as their value.

use bytes::Bytes;
use log::{debug, trace};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pipeline::describe::ElementSpec;
use crate::pipeline::stage::{Flow, Stage, StageContext};
use crate::pipeline::state::RunState;
use crate::pipeline::types::{Caps, Frame, Timestamp};

pub const MOTION_BEGIN: &str = "motion_begin";
pub const MOTION_FINISHED: &str = "motion_finished";

/// Per-pixel difference below which a pixel counts as unchanged
const PIXEL_THRESHOLD: u8 = 16;

pub struct MotionCells {
    gap: Duration,
    sensitivity: f64,

    previous: Option<Bytes>,
    last_motion: Option<Timestamp>,
    in_motion: bool,
}

impl MotionCells {
    pub fn new(gap: Duration, sensitivity: f64) -> Self {
        Self {
            gap,
            sensitivity,
            previous: None,
            last_motion: None,
            in_motion: false,
        }
    }

    pub fn from_spec(spec: &ElementSpec) -> Result<Self> {
        let gap: f64 = spec.parsed("gap")?.unwrap_or(3.0);
        let sensitivity: f64 = spec.parsed("sensitivity")?.unwrap_or(0.02);
        if !gap.is_finite() || gap < 0.0 {
            return Err(Error::config(format!("motioncells: bad gap {}", gap)));
        }
        if !(0.0..=1.0).contains(&sensitivity) {
            return Err(Error::config(format!(
                "motioncells: sensitivity {} outside 0..1",
                sensitivity
            )));
        }
        let gap = Duration::try_from_secs_f64(gap)
            .map_err(|e| Error::config(format!("motioncells: gap {}: {}", gap, e)))?;
        Ok(Self::new(gap, sensitivity))
    }

    pub fn in_motion(&self) -> bool {
        self.in_motion
    }

    /// Share of pixels that changed noticeably since `previous`
    fn changed_ratio(previous: &[u8], current: &[u8]) -> f64 {
        if previous.len() != current.len() || current.is_empty() {
            return 0.0;
        }
        let changed = previous
            .iter()
            .zip(current)
            .filter(|(a, b)| a.abs_diff(**b) > PIXEL_THRESHOLD)
            .count();
        changed as f64 / current.len() as f64
    }

    fn post(ctx: &StageContext<'_>, key: &str, pts: Timestamp) {
        let mut fields = Map::new();
        fields.insert(key.to_string(), Value::from(pts.micros));
        ctx.post_element(fields);
    }

    fn analyse(&mut self, frame: &Frame, ctx: &StageContext<'_>) {
        let ratio = self
            .previous
            .as_ref()
            .map_or(0.0, |prev| Self::changed_ratio(prev, &frame.data));
        self.previous = Some(frame.data.clone());
        trace!("MotionCells: frame {} changed {:.3}", frame.sequence, ratio);

        if ratio > 0.0 && ratio >= self.sensitivity {
            self.last_motion = Some(frame.pts);
            if !self.in_motion {
                self.in_motion = true;
                debug!("MotionCells: motion began at {}", frame.pts);
                Self::post(ctx, MOTION_BEGIN, frame.pts);
            }
        } else if self.in_motion
            && self
                .last_motion
                .is_none_or(|last| frame.pts.diff(last) >= self.gap)
        {
            self.in_motion = false;
            debug!("MotionCells: motion finished at {}", frame.pts);
            Self::post(ctx, MOTION_FINISHED, frame.pts);
        }
    }
}

impl Stage for MotionCells {
    fn kind(&self) -> &'static str {
        "motioncells"
    }

    fn process(&mut self, frame: Frame, ctx: &StageContext<'_>) -> Result<Flow> {
        self.analyse(&frame, ctx);
        Ok(Flow::Forward(frame))
    }

    fn change_state(&mut self, _from: RunState, to: RunState) -> Result<()> {
        if to == RunState::Stopped {
            self.previous = None;
            self.last_motion = None;
            self.in_motion = false;
        }
        Ok(())
    }

    fn accepts(&self, caps: &Caps) -> bool {
        caps.can_intersect(&Caps::new("video/x-raw"))
    }
}
