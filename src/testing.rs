//! Test doubles: a channel-fed source and stages that record what the graph
//! does to them.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pipeline::describe::ElementSpec;
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::stage::{Element, Flow, Source, Stage, StageContext};
use crate::pipeline::state::RunState;
use crate::pipeline::types::{Caps, Frame, Timestamp};

#[derive(Default)]
struct Log {
    states: HashMap<String, Vec<RunState>>,
    frames: HashMap<String, u64>,
    created: Vec<String>,
    refuse_start: HashSet<String>,
    refuse_links: bool,
}

/// Shared log of stage creation, state changes and frames
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Log>>,
}

impl Recorder {
    /// States `name` was driven into, in order
    pub fn states(&self, name: &str) -> Vec<RunState> {
        self.log
            .lock()
            .unwrap()
            .states
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn frames(&self, name: &str) -> u64 {
        self.log.lock().unwrap().frames.get(name).copied().unwrap_or(0)
    }

    /// Names of recording stages in creation order
    pub fn created(&self) -> Vec<String> {
        self.log.lock().unwrap().created.clone()
    }

    /// Make `name` fail its `Stopped -> Paused` step
    pub fn refuse_start(&self, name: &str) {
        self.log.lock().unwrap().refuse_start.insert(name.to_string());
    }

    /// Make every `picky` stage refuse upstream links
    pub fn refuse_links(&self, refuse: bool) {
        self.log.lock().unwrap().refuse_links = refuse;
    }
}

struct RecordingStage {
    name: String,
    kind: &'static str,
    consume: bool,
    recorder: Recorder,
}

impl Stage for RecordingStage {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn process(&mut self, frame: Frame, _ctx: &StageContext<'_>) -> Result<Flow> {
        *self
            .recorder
            .log
            .lock()
            .unwrap()
            .frames
            .entry(self.name.clone())
            .or_default() += 1;
        if self.consume {
            Ok(Flow::Consumed)
        } else {
            Ok(Flow::Forward(frame))
        }
    }

    fn change_state(&mut self, from: RunState, to: RunState) -> Result<()> {
        let mut log = self.recorder.log.lock().unwrap();
        if from == RunState::Stopped && log.refuse_start.contains(&self.name) {
            return Err(Error::stage("refusing to start"));
        }
        log.states.entry(self.name.clone()).or_default().push(to);
        Ok(())
    }

    fn accepts(&self, _caps: &Caps) -> bool {
        self.kind != "picky" || !self.recorder.log.lock().unwrap().refuse_links
    }
}

/// Source fed from a [`FrameFeed`]. Dropping the feed ends the stream.
struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl Source for ChannelSource {
    fn kind(&self) -> &'static str {
        "appsrc"
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await
    }

    fn output_caps(&self) -> Caps {
        Caps::new("video/x-raw")
    }
}

pub struct FrameFeed {
    tx: mpsc::UnboundedSender<Result<Frame>>,
}

impl FrameFeed {
    /// Push a 4x4 frame filled with `sequence`
    pub fn push(&self, sequence: u64) {
        self.push_filled(sequence, sequence as u8);
    }

    pub fn push_filled(&self, sequence: u64, fill: u8) {
        let frame = Frame::video(
            Bytes::from(vec![fill; 16]),
            Timestamp::from_micros(sequence as i64 * 1000),
            sequence,
            4,
            4,
        );
        let _ = self.tx.send(Ok(frame));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(Error::stage(message)));
    }
}

/// Built-ins plus `appsrc` wired to the returned feed, and recording
/// `fakesink`, `filesink`, `queue` and `picky` kinds.
pub fn test_registry(recorder: &Recorder) -> (StageRegistry, FrameFeed) {
    let mut registry = StageRegistry::with_builtins();
    let (tx, rx) = mpsc::unbounded_channel();

    let rx = Mutex::new(Some(rx));
    registry.register("appsrc", move |_| {
        let rx = rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::config("appsrc feed already taken"))?;
        Ok(Element::Source(Box::new(ChannelSource { rx })))
    });

    for (kind, consume) in [
        ("fakesink", true),
        ("filesink", true),
        ("queue", false),
        ("picky", false),
    ] {
        let recorder = recorder.clone();
        registry.register(kind, move |spec: &ElementSpec| {
            let name = spec.name.clone().unwrap_or_else(|| kind.to_string());
            recorder.log.lock().unwrap().created.push(name.clone());
            Ok(Element::Stage(Box::new(RecordingStage {
                name,
                kind,
                consume,
                recorder: recorder.clone(),
            })))
        });
    }

    (registry, FrameFeed { tx })
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}
