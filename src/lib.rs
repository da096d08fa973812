//! Motion-triggered camera pipeline.
//!
//! A fixed backbone (capture, decode, motion analysis) runs continuously
//! while snapshot, recording and live preview branches are attached to and
//! detached from it on the fly.

pub mod config;
pub mod error;
pub mod motion;
pub mod pipeline;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use motion::{Motion, MotionState};
