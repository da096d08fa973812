use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::pipeline::describe::ElementSpec;
use crate::pipeline::stage::{Flow, Stage, StageContext};
use crate::pipeline::state::RunState;
use crate::pipeline::types::Frame;

/// Swallows frames, keeping a count.
pub struct FakeSink {
    kind: &'static str,
    frames: u64,
}

impl FakeSink {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, frames: 0 }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Stage for FakeSink {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn process(&mut self, _frame: Frame, _ctx: &StageContext<'_>) -> Result<Flow> {
        self.frames += 1;
        Ok(Flow::Consumed)
    }
}

/// Appends every frame payload to `location`.
///
/// The file is created when the sink leaves `Stopped` and flushed and closed
/// when it returns there, so a removed branch never leaves a handle open.
pub struct FileSink {
    location: PathBuf,
    writer: Option<BufWriter<File>>,
    frames: u64,
    bytes: u64,
}

impl FileSink {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            writer: None,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn from_spec(spec: &ElementSpec) -> Result<Self> {
        let location = spec
            .property("location")
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::config("filesink needs a location"))?;
        Ok(Self::new(location))
    }

    pub fn location(&self) -> &PathBuf {
        &self.location
    }

    fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.location.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.location)?;
        self.writer = Some(BufWriter::new(file));
        debug!("FileSink: opened {}", self.location.display());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(
                "FileSink: closed {} ({} frames, {} bytes)",
                self.location.display(),
                self.frames,
                self.bytes
            );
        }
        Ok(())
    }
}

impl Stage for FileSink {
    fn kind(&self) -> &'static str {
        "filesink"
    }

    fn process(&mut self, frame: Frame, _ctx: &StageContext<'_>) -> Result<Flow> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::stage(format!("{} is not open", self.location.display()))
        })?;
        writer.write_all(&frame.data)?;
        self.frames += 1;
        self.bytes += frame.size() as u64;
        Ok(Flow::Consumed)
    }

    fn change_state(&mut self, from: RunState, to: RunState) -> Result<()> {
        match (from, to) {
            (RunState::Stopped, RunState::Paused) => self.open(),
            (RunState::Paused, RunState::Stopped) => self.close(),
            _ => Ok(()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::Bus;
    use crate::pipeline::types::Timestamp;
    use bytes::Bytes;

    fn frame(data: &'static [u8]) -> Frame {
        Frame::video(Bytes::from_static(data), Timestamp::default(), 0, 1, 1)
    }

    #[test]
    fn test_file_sink_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");
        let mut sink = FileSink::new(&path);
        let bus = Bus::default();
        let ctx = StageContext::new("sink", &bus);

        assert!(sink.process(frame(b"x"), &ctx).is_err());

        sink.change_state(RunState::Stopped, RunState::Paused).unwrap();
        sink.change_state(RunState::Paused, RunState::Running).unwrap();
        sink.process(frame(b"abc"), &ctx).unwrap();
        sink.process(frame(b"def"), &ctx).unwrap();
        sink.change_state(RunState::Running, RunState::Paused).unwrap();
        sink.change_state(RunState::Paused, RunState::Stopped).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_file_sink_requires_location() {
        let spec = crate::pipeline::describe::parse("filesink")
            .unwrap()
            .elements
            .remove(0);
        assert!(matches!(
            FileSink::from_spec(&spec),
            Err(Error::Configuration(_))
        ));
    }
}
