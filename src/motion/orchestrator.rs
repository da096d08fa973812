//! Control loop and application handle
//!
//! A single task owns the graph and the topology controller. Application
//! commands, bus events from the data task and drain barrier callbacks all
//! arrive on one unbounded queue and are handled strictly in order, so graph
//! mutations never interleave.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::beacon::{Beacon, DomainEvent, EventKind, Watcher};
use super::branches::{self, BranchCatalog};
use super::policy;
use super::router::EventRouter;
use super::topology::TopologyController;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::barrier::DrainBarrier;
use crate::pipeline::describe;
use crate::pipeline::event::{Bus, ControlEvent};
use crate::pipeline::graph::StageGraph;
use crate::pipeline::health::FlowSummary;
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::state::RunState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Stop,
    StartLive,
    StopLive,
    /// Record to `<path>.mp4`
    StartCapture(PathBuf),
    StopCapture,
    /// Write one frame to `<path>.jpg`
    Snapshot(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Idle,
    Running,
}

impl std::fmt::Display for MotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MotionState::Idle => write!(f, "idle"),
            MotionState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Status {
    pub state: MotionState,
    pub graph_state: RunState,
    pub attachments: Vec<String>,
    pub detaches: u64,
    pub stats: FlowSummary,
}

enum Deferred {
    /// Scheduled by the snapshot drain barrier
    Detach(String),
}

enum ControlMsg {
    Command {
        command: Command,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Bus(ControlEvent),
    Deferred(Deferred),
    Status(oneshot::Sender<Status>),
    Shutdown,
}

/// Cloneable handle to a motion control loop.
///
/// The loop ends on [`shutdown`](Self::shutdown) or once every handle is
/// dropped, stopping the graph on the way out.
#[derive(Clone)]
pub struct Motion {
    tx: mpsc::UnboundedSender<ControlMsg>,
    beacon: Arc<Beacon>,
}

/// Non-owning handle, for callbacks that must not keep the loop alive
#[derive(Clone)]
pub struct WeakMotion {
    tx: mpsc::WeakUnboundedSender<ControlMsg>,
    beacon: Weak<Beacon>,
}

impl WeakMotion {
    pub fn upgrade(&self) -> Option<Motion> {
        Some(Motion {
            tx: self.tx.upgrade()?,
            beacon: self.beacon.upgrade()?,
        })
    }
}

impl Motion {
    /// Start the control loop. The graph is not built until [`run`](Self::run).
    pub fn spawn(config: Config, registry: StageRegistry) -> (Motion, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let beacon = Arc::new(Beacon::new());
        let orchestrator = Orchestrator::new(config, registry, beacon.clone(), tx.downgrade());

        let motion = Motion { tx, beacon };
        if orchestrator.config.automation {
            policy::install(&motion, orchestrator.config.output_dir.clone());
        }
        let handle = tokio::spawn(orchestrator.run(rx));
        (motion, handle)
    }

    pub fn downgrade(&self) -> WeakMotion {
        WeakMotion {
            tx: self.tx.downgrade(),
            beacon: Arc::downgrade(&self.beacon),
        }
    }

    /// Queue `command` without waiting. Failures are logged by the loop.
    pub fn post(&self, command: Command) -> Result<()> {
        self.tx
            .send(ControlMsg::Command {
                command,
                reply: None,
            })
            .map_err(|_| Error::Closed)
    }

    /// Queue `command` and wait for its outcome.
    pub async fn request(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMsg::Command {
                command,
                reply: Some(reply),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn run(&self) -> Result<()> {
        self.request(Command::Run).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    pub async fn start_live(&self) -> Result<()> {
        self.request(Command::StartLive).await
    }

    pub async fn stop_live(&self) -> Result<()> {
        self.request(Command::StopLive).await
    }

    pub async fn start_capture(&self, output: impl Into<PathBuf>) -> Result<()> {
        self.request(Command::StartCapture(output.into())).await
    }

    pub async fn stop_capture(&self) -> Result<()> {
        self.request(Command::StopCapture).await
    }

    pub async fn snapshot(&self, output: impl Into<PathBuf>) -> Result<()> {
        self.request(Command::Snapshot(output.into())).await
    }

    pub fn watch(&self, kind: EventKind, watcher: Watcher) -> bool {
        self.beacon.watch(kind, watcher)
    }

    pub fn unwatch(&self, kind: EventKind, watcher: &Watcher) -> bool {
        self.beacon.unwatch(kind, watcher)
    }

    pub async fn status(&self) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMsg::Status(reply))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub async fn state(&self) -> Result<MotionState> {
        Ok(self.status().await?.state)
    }

    pub async fn attachments(&self) -> Result<Vec<String>> {
        Ok(self.status().await?.attachments)
    }

    pub async fn stats(&self) -> Result<FlowSummary> {
        Ok(self.status().await?.stats)
    }

    /// Stop the graph and end the control loop.
    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(ControlMsg::Shutdown).map_err(|_| Error::Closed)
    }

    /// Feed a control event as if the graph had posted it
    #[cfg(test)]
    pub(crate) fn inject(&self, event: ControlEvent) {
        let _ = self.tx.send(ControlMsg::Bus(event));
    }
}

struct Orchestrator {
    config: Config,
    registry: StageRegistry,
    beacon: Arc<Beacon>,
    router: EventRouter,
    topology: TopologyController,
    /// Present while running
    graph: Option<StageGraph>,
    tx: mpsc::WeakUnboundedSender<ControlMsg>,
}

impl Orchestrator {
    fn new(
        config: Config,
        registry: StageRegistry,
        beacon: Arc<Beacon>,
        tx: mpsc::WeakUnboundedSender<ControlMsg>,
    ) -> Self {
        let topology = TopologyController::new(
            config.junction.clone(),
            BranchCatalog::new(&config.branches),
            registry.clone(),
        );
        Self {
            router: EventRouter::new(config.analysis_stage.clone()),
            beacon,
            topology,
            registry,
            graph: None,
            tx,
            config,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
        let stats_enabled = self.config.stats_interval > 0;
        let period = Duration::from_secs(self.config.stats_interval.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!("Orchestrator: control loop started");
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    None | Some(ControlMsg::Shutdown) => break,
                    Some(msg) => self.handle(msg).await,
                },
                _ = ticker.tick(), if stats_enabled => self.report(period),
            }
        }

        self.stop().await;
        info!("Orchestrator: control loop finished");
    }

    async fn handle(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Command { command, reply } => {
                let label = format!("{:?}", command);
                let result = self.execute(command).await;
                if let Err(e) = &result {
                    warn!("Orchestrator: {} failed: {}", label, e);
                    if e.is_fatal() {
                        error!("Orchestrator: stopping after fatal error");
                        self.stop().await;
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ControlMsg::Bus(event) => self.on_event(event).await,
            ControlMsg::Deferred(Deferred::Detach(name)) => self.deferred_detach(&name).await,
            ControlMsg::Status(reply) => {
                let _ = reply.send(self.status());
            }
            ControlMsg::Shutdown => {}
        }
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Run => self.start().await,
            Command::Stop => {
                self.stop().await;
                Ok(())
            }
            Command::StartLive => self.attach(branches::LIVE, HashMap::new()).await,
            Command::StopLive => self.detach(branches::LIVE).await,
            Command::StartCapture(output) => {
                let params = HashMap::from([(branches::ENCODE_OUTPUT.to_string(), quoted(&output)?)]);
                self.attach(branches::ENCODE, params).await
            }
            Command::StopCapture => self.detach(branches::ENCODE).await,
            Command::Snapshot(output) => self.snapshot(&output).await,
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.graph.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let description = describe::resolve(&self.config.backbone, &self.config.backbone_params())?;
        debug!("Orchestrator: backbone {}", description);
        let mut graph = StageGraph::from_description(&description, &self.registry)?;
        if graph.by_name(&self.config.junction).is_none() {
            return Err(Error::config(format!(
                "backbone has no junction named {}",
                self.config.junction
            )));
        }

        let tx = self.tx.clone();
        graph.on_event(Bus::new(move |event| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(ControlMsg::Bus(event));
            }
        }));

        if let Err(e) = graph.set_state(RunState::Running).await.verify(RunState::Running) {
            graph.set_state(RunState::Stopped).await;
            return Err(e);
        }
        self.graph = Some(graph);

        info!("Orchestrator: running");
        self.beacon.emit(&DomainEvent::Ready);
        Ok(())
    }

    /// Stop and release the graph. Does nothing when idle.
    async fn stop(&mut self) {
        let Some(mut graph) = self.graph.take() else {
            debug!("Orchestrator: stop while idle");
            return;
        };

        let change = graph.set_state(RunState::Stopped).await;
        if !change.ok {
            warn!(
                "Orchestrator: graph stopped uncleanly (reached {}, pending {:?})",
                change.state, change.pending
            );
        }
        self.topology.clear();
        info!("Orchestrator: stopped, {}", graph.stats().summary());
    }

    async fn attach(&mut self, name: &str, params: HashMap<String, String>) -> Result<()> {
        let graph = self.graph.as_mut().ok_or(Error::NotRunning)?;
        self.topology.attach(graph, name, &params, false).await.map(|_| ())
    }

    /// Nothing is attached while idle, so there is nothing to detach.
    async fn detach(&mut self, name: &str) -> Result<()> {
        let Some(graph) = self.graph.as_mut() else {
            debug!("Orchestrator: detach of {} while idle", name);
            return Ok(());
        };
        self.topology.detach(graph, name).await.map(|_| ())
    }

    /// Attach the snapshot branch held paused, fence its sink with a barrier
    /// that lets one frame through, then resume. The barrier schedules the
    /// detach once the second frame shows up.
    async fn snapshot(&mut self, output: &Path) -> Result<()> {
        let params = HashMap::from([(branches::SNAPSHOT_OUTPUT.to_string(), quoted(output)?)]);
        let graph = self.graph.as_mut().ok_or(Error::NotRunning)?;
        self.topology
            .attach(graph, branches::SNAPSHOT, &params, true)
            .await?;

        let tx = self.tx.clone();
        let barrier = Arc::new(DrainBarrier::after_items(1, move || {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(ControlMsg::Deferred(Deferred::Detach(
                    branches::SNAPSHOT.to_string(),
                )));
            }
        }));

        let armed = graph
            .by_name(branches::SNAPSHOT_SINK)
            .and_then(|sink| graph.link_into(sink))
            .ok_or_else(|| {
                Error::config(format!(
                    "snapshot branch has no linked {}",
                    branches::SNAPSHOT_SINK
                ))
            })
            .and_then(|link| self.topology.arm(graph, branches::SNAPSHOT, link, barrier));

        if let Err(e) = armed {
            // detach resumes the graph
            self.topology.detach(graph, branches::SNAPSHOT).await?;
            return Err(e);
        }
        TopologyController::resume(graph).await
    }

    async fn deferred_detach(&mut self, name: &str) {
        let armed = self
            .topology
            .barrier(name)
            .is_some_and(|b| b.state().armed);
        if !armed {
            debug!("Orchestrator: stale detach of {} ignored", name);
            return;
        }
        let Some(graph) = self.graph.as_mut() else { return };
        if let Err(e) = self.topology.detach(graph, name).await {
            error!("Orchestrator: deferred detach of {} failed: {}", name, e);
            if e.is_fatal() {
                self.stop().await;
            }
        }
    }

    async fn on_event(&mut self, event: ControlEvent) {
        if self.graph.is_none() {
            debug!("Orchestrator: idle, dropping {:?}", event);
            return;
        }
        let Some(domain) = self.router.dispatch(&event, &self.beacon) else {
            return;
        };
        match domain {
            DomainEvent::Eos => {
                info!("Orchestrator: end of stream");
                self.stop().await;
            }
            DomainEvent::Error { code, message } => {
                error!("Orchestrator: {} error: {}", code, message);
                self.stop().await;
            }
            _ => {}
        }
    }

    fn status(&self) -> Status {
        let (graph_state, stats) = match &self.graph {
            Some(graph) => (graph.state(), graph.stats().summary()),
            None => (RunState::Stopped, FlowSummary::default()),
        };
        Status {
            state: if self.graph.is_some() {
                MotionState::Running
            } else {
                MotionState::Idle
            },
            graph_state,
            attachments: self.topology.attachments(),
            detaches: self.topology.detaches(),
            stats,
        }
    }

    fn report(&self, period: Duration) {
        let Some(graph) = &self.graph else { return };
        let stats = graph.stats();
        info!(
            "Orchestrator: {} [{}]",
            stats.summary(),
            self.topology.attachments().join(", ")
        );
        if stats.is_stalled(period * 3) {
            warn!("Orchestrator: no frames for {:?}", period * 3);
        }
    }
}

/// Quote a path for substitution into a description. The tokenizer has no
/// escapes, so a path holding a quote cannot be expressed.
fn quoted(path: &Path) -> Result<String> {
    let text = path.display().to_string();
    if text.contains('"') {
        return Err(Error::config(format!("output path {:?} contains a quote", text)));
    }
    Ok(format!("\"{}\"", text))
}
