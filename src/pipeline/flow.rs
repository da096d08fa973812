//! Data loop
//!
//! One task per running graph pulls frames from the source and pushes them
//! through the published topology. Run state requests arrive on a watch
//! channel and are acknowledged only between frames.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::barrier::Verdict;
use super::event::{Bus, ControlEvent, ErrorCode};
use super::graph::{StageId, TopoNode, Topology};
use super::health::FlowStats;
use super::stage::{Flow, Source, StageContext};
use super::state::RunState;
use super::types::Frame;
use crate::error::{Error, Result};

/// Control-side end of a running data loop
pub(crate) struct FlowHandle {
    target: watch::Sender<RunState>,
    reached: watch::Receiver<RunState>,
    task: JoinHandle<()>,
}

impl FlowHandle {
    /// Spawn the loop. It starts out heading for `Paused`.
    pub(crate) fn spawn(
        source: Box<dyn Source>,
        head: StageId,
        source_name: String,
        topology: watch::Receiver<Arc<Topology>>,
        bus: Bus,
        stats: Arc<FlowStats>,
    ) -> Self {
        let (target, target_rx) = watch::channel(RunState::Paused);
        let (reached_tx, reached) = watch::channel(RunState::Stopped);

        let data_loop = DataLoop {
            source,
            head,
            source_name,
            topology,
            bus,
            stats,
            target: target_rx,
            reached: reached_tx,
            drained: false,
        };
        let task = tokio::spawn(data_loop.run());

        Self {
            target,
            reached,
            task,
        }
    }

    /// Ask the loop for `target` and wait until it is acknowledged.
    pub(crate) async fn request(&mut self, target: RunState) -> Result<()> {
        self.target.send_replace(target);
        self.reached
            .wait_for(|reached| *reached == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::stage(format!("data loop exited before reaching {}", target)))
    }

    pub(crate) async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("DataLoop: task ended abnormally: {}", e);
        }
    }

    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

struct DataLoop {
    source: Box<dyn Source>,
    head: StageId,
    source_name: String,
    topology: watch::Receiver<Arc<Topology>>,
    bus: Bus,
    stats: Arc<FlowStats>,
    target: watch::Receiver<RunState>,
    reached: watch::Sender<RunState>,
    /// Source hit end of stream or failed; only state changes remain
    drained: bool,
}

impl DataLoop {
    async fn run(mut self) {
        info!("DataLoop: started ({})", self.source_name);

        loop {
            let target = *self.target.borrow_and_update();
            self.reached.send_if_modified(|reached| {
                let changed = *reached != target;
                *reached = target;
                changed
            });

            match target {
                RunState::Stopped => break,
                RunState::Running if !self.drained => {
                    let next = tokio::select! {
                        biased;
                        changed = self.target.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        next = self.source.next_frame() => next,
                    };
                    self.handle(next);
                }
                _ => {
                    if self.target.changed().await.is_err() {
                        break;
                    }
                }
            }
        }

        self.reached.send_replace(RunState::Stopped);
        info!(
            "DataLoop: finished ({}), {}",
            self.source_name,
            self.stats.summary()
        );
    }

    fn handle(&mut self, next: Option<Result<Frame>>) {
        match next {
            Some(Ok(frame)) => {
                self.stats.record_pull(frame.size());
                self.push(frame);
            }
            Some(Err(e)) => {
                warn!("DataLoop: {} failed: {}", self.source_name, e);
                self.drained = true;
                self.bus.post(ControlEvent::error(
                    ErrorCode::Source,
                    format!("{}: {}", self.source_name, e),
                ));
            }
            None => {
                info!("DataLoop: end of stream from {}", self.source_name);
                self.drained = true;
                self.bus.post(ControlEvent::EndOfStream {
                    source: self.source_name.clone(),
                });
            }
        }
    }

    /// Walk one frame through the current topology, depth first.
    fn push(&self, frame: Frame) {
        let topology = self.topology.borrow().clone();
        let Some(head) = topology.node(self.head) else {
            debug!("DataLoop: source not in topology, dropping frame");
            return;
        };

        let mut pending = Vec::new();
        self.fan_out(head, frame, &mut pending);

        while let Some((id, frame)) = pending.pop() {
            let Some(node) = topology.node(id) else { continue };
            let Some(stage) = &node.stage else { continue };

            let ctx = StageContext::new(&node.name, &self.bus);
            let result = match stage.lock() {
                Ok(mut stage) => stage.process(frame, &ctx),
                Err(_) => Err(Error::stage("stage lock poisoned")),
            };

            match result {
                Ok(Flow::Forward(frame)) if !node.outputs.is_empty() => {
                    self.fan_out(node, frame, &mut pending)
                }
                Ok(_) => self.stats.record_consumed(),
                Err(e) => {
                    self.stats.record_stage_error();
                    ctx.post_error(ErrorCode::Stream, e);
                }
            }
        }
    }

    fn fan_out(&self, node: &TopoNode, frame: Frame, pending: &mut Vec<(StageId, Frame)>) {
        // reversed so the first link is processed first
        for link in node.outputs.iter().rev() {
            if let Some(barrier) = &link.barrier {
                if barrier.observe() == Verdict::Drop {
                    self.stats.record_barrier_drop();
                    continue;
                }
            }
            pending.push((link.to, frame.clone()));
        }
    }
}
