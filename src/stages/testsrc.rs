use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::pipeline::describe::ElementSpec;
use crate::pipeline::stage::Source;
use crate::pipeline::types::{Caps, Frame, Timestamp};

const BACKGROUND: u8 = 0x20;
const FOREGROUND: u8 = 0xe0;

/// Synthetic grey frames at a fixed rate.
///
/// With `motion-period` set, every period starts with `motion-length` frames
/// in which a bright block moves across the picture; the rest are identical.
/// `num-buffers` ends the stream after that many frames.
pub struct TestSource {
    fps: u32,
    width: u32,
    height: u32,
    num_buffers: Option<u64>,
    motion_period: u64,
    motion_length: u64,

    interval: Option<Interval>,
    start: Option<Instant>,
    sequence: u64,
}

impl TestSource {
    pub fn new(fps: u32, width: u32, height: u32) -> Self {
        Self {
            fps: fps.max(1),
            width: width.max(1),
            height: height.max(1),
            num_buffers: None,
            motion_period: 0,
            motion_length: 0,
            interval: None,
            start: None,
            sequence: 0,
        }
    }

    pub fn from_spec(spec: &ElementSpec) -> Result<Self> {
        let mut source = Self::new(
            spec.parsed("fps")?.unwrap_or(10),
            spec.parsed("width")?.unwrap_or(64),
            spec.parsed("height")?.unwrap_or(48),
        );
        // negative means unlimited
        source.num_buffers = spec
            .parsed::<i64>("num-buffers")?
            .and_then(|n| u64::try_from(n).ok());
        source.motion_period = spec.parsed("motion-period")?.unwrap_or(0);
        source.motion_length = spec.parsed("motion-length")?.unwrap_or(0);
        if source.motion_length > source.motion_period {
            return Err(Error::config(format!(
                "testsrc: motion-length {} exceeds motion-period {}",
                source.motion_length, source.motion_period
            )));
        }
        Ok(source)
    }

    fn moving(&self, sequence: u64) -> bool {
        self.motion_period > 0 && sequence % self.motion_period < self.motion_length
    }

    fn render(&self, sequence: u64) -> Bytes {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut buf = BytesMut::with_capacity(w * h);
        buf.put_bytes(BACKGROUND, w * h);

        if self.moving(sequence) {
            let block = (w.min(h) / 4).max(1);
            let x = (sequence as usize * block) % w.saturating_sub(block).max(1);
            let y = h / 2 - block.min(h) / 2;
            for row in y..(y + block).min(h) {
                let start = row * w + x;
                let end = (start + block).min((row + 1) * w);
                buf[start..end].fill(FOREGROUND);
            }
        }
        buf.freeze()
    }
}

#[async_trait]
impl Source for TestSource {
    fn kind(&self) -> &'static str {
        "testsrc"
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.num_buffers.is_some_and(|n| self.sequence >= n) {
            debug!("TestSource: {} buffers produced", self.sequence);
            return None;
        }

        let fps = self.fps;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(Duration::from_secs(1) / fps);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;

        let now = Instant::now();
        let start = *self.start.get_or_insert(now);
        let sequence = self.sequence;
        self.sequence += 1;

        Some(Ok(Frame::video(
            self.render(sequence),
            Timestamp::from_instant(now, start),
            sequence,
            self.width,
            self.height,
        )))
    }

    fn output_caps(&self) -> Caps {
        Caps::new("video/x-raw")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::describe::parse;

    fn source(desc: &str) -> TestSource {
        TestSource::from_spec(&parse(desc).unwrap().elements[0]).unwrap()
    }

    #[tokio::test]
    async fn test_num_buffers_ends_stream() {
        let mut src = source("testsrc fps=1000 num-buffers=3");
        for expected in 0..3 {
            let frame = src.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.size(), 64 * 48);
        }
        assert!(src.next_frame().await.is_none());
    }

    #[test]
    fn test_motion_bursts() {
        let src = source("testsrc motion-period=10 motion-length=2 width=32 height=24");
        assert!(src.moving(0));
        assert!(src.moving(1));
        assert!(!src.moving(2));
        assert!(src.moving(10));

        assert_ne!(src.render(0), src.render(1));
        assert_eq!(src.render(2), src.render(3));
    }

    #[test]
    fn test_bad_properties() {
        let spec = &parse("testsrc fps=fast").unwrap().elements[0];
        assert!(matches!(TestSource::from_spec(spec), Err(Error::Parse(_))));

        let spec = &parse("testsrc motion-period=2 motion-length=5").unwrap().elements[0];
        assert!(matches!(
            TestSource::from_spec(spec),
            Err(Error::Configuration(_))
        ));
    }
}
