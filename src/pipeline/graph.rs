//! In-memory stage graph
//!
//! Stages live in a generational arena and are addressed by [`StageId`];
//! links are addressed by [`LinkId`]. All structural edits happen on the
//! control thread through `&mut StageGraph`. The data thread never sees the
//! arena: it reads an immutable [`Topology`] that is republished with
//! [`StageGraph::publish`] while data flow is paused.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::barrier::DrainBarrier;
use super::describe::{self, ParsedGraph};
use super::event::Bus;
use super::flow::FlowHandle;
use super::health::FlowStats;
use super::registry::StageRegistry;
use super::stage::{Element, Source, Stage};
use super::state::{RunState, StateChange};
use super::types::Caps;
use crate::error::{Error, Result};

pub type SharedStage = Arc<Mutex<Box<dyn Stage>>>;

/// Opaque handle to a stage in the arena. Stale handles never alias a newer
/// stage that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

enum Body {
    /// The source object itself moves into the data loop on start
    Source { caps: Caps },
    Stage(SharedStage),
}

struct StageNode {
    name: String,
    kind: &'static str,
    body: Body,
    state: RunState,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    node: Option<StageNode>,
}

/// A directed data connection between two stages
#[derive(Clone)]
pub struct Link {
    pub from: StageId,
    pub to: StageId,
    pub caps: Caps,
    barrier: Option<Arc<DrainBarrier>>,
}

impl Link {
    pub fn barrier(&self) -> Option<&Arc<DrainBarrier>> {
        self.barrier.as_ref()
    }
}

/// Immutable view of the graph handed to the data thread
#[derive(Default)]
pub struct Topology {
    nodes: HashMap<StageId, TopoNode>,
}

pub(crate) struct TopoNode {
    pub name: String,
    pub stage: Option<SharedStage>,
    pub outputs: Vec<TopoLink>,
}

pub(crate) struct TopoLink {
    pub to: StageId,
    pub barrier: Option<Arc<DrainBarrier>>,
}

impl Topology {
    pub(crate) fn node(&self, id: StageId) -> Option<&TopoNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Elements created from a description but not yet part of any graph
pub struct Subgraph {
    elements: Vec<(Option<String>, Element)>,
    links: Vec<(usize, usize)>,
}

impl Subgraph {
    pub fn instantiate(parsed: &ParsedGraph, registry: &StageRegistry) -> Result<Self> {
        let elements = parsed
            .elements
            .iter()
            .map(|spec| Ok((spec.name.clone(), registry.make(spec)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            elements,
            links: parsed.links.clone(),
        })
    }

    /// Parse and instantiate in one go
    pub fn from_description(description: &str, registry: &StageRegistry) -> Result<Self> {
        Self::instantiate(&describe::parse(description)?, registry)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// A stage taken out of the graph, still holding whatever it had open
pub struct RemovedStage {
    pub name: String,
    stage: Option<SharedStage>,
    state: RunState,
}

impl RemovedStage {
    /// Drive the stage down to `Stopped`, releasing its resources.
    pub fn retire(mut self) -> Result<()> {
        let Some(stage) = self.stage.take() else {
            return Ok(());
        };
        let mut stage = stage
            .lock()
            .map_err(|_| Error::stage(format!("{}: stage lock poisoned", self.name)))?;
        for step in self.state.path_to(RunState::Stopped) {
            stage.change_state(self.state, step)?;
            self.state = step;
        }
        Ok(())
    }
}

pub struct StageGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    names: HashMap<String, StageId>,
    counters: HashMap<&'static str, u32>,
    links: BTreeMap<LinkId, Link>,
    next_link: u64,

    head: Option<StageId>,
    source: Option<Box<dyn Source>>,

    state: RunState,
    bus: Bus,
    flow: Option<FlowHandle>,
    stats: Arc<FlowStats>,
    topology: watch::Sender<Arc<Topology>>,
}

impl StageGraph {
    pub fn new() -> Self {
        let (topology, _) = watch::channel(Arc::new(Topology::default()));
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            names: HashMap::new(),
            counters: HashMap::new(),
            links: BTreeMap::new(),
            next_link: 0,
            head: None,
            source: None,
            state: RunState::Stopped,
            bus: Bus::default(),
            flow: None,
            stats: Arc::new(FlowStats::new()),
            topology,
        }
    }

    /// Compile a description into a fresh graph
    pub fn from_description(description: &str, registry: &StageRegistry) -> Result<Self> {
        let mut graph = Self::new();
        graph.add_subgraph(Subgraph::from_description(description, registry)?)?;
        Ok(graph)
    }

    /// Subscribe to control events. Takes effect on the next start.
    pub fn on_event(&mut self, bus: Bus) {
        self.bus = bus;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> Arc<FlowStats> {
        self.stats.clone()
    }

    pub fn stage_count(&self) -> usize {
        self.names.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.node(id).is_some()
    }

    pub fn by_name(&self, name: &str) -> Option<StageId> {
        self.names.get(name).copied()
    }

    pub fn name_of(&self, id: StageId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    /// The link feeding `to`, if any
    pub fn link_into(&self, to: StageId) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, l)| l.to == to)
            .map(|(id, _)| *id)
    }

    pub fn links_from(&self, from: StageId) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|(_, l)| l.from == from)
            .map(|(id, _)| *id)
            .collect()
    }

    fn node(&self, id: StageId) -> Option<&StageNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn auto_name(&mut self, kind: &'static str) -> String {
        loop {
            let counter = self.counters.entry(kind).or_insert(0);
            let name = format!("{}{}", kind, counter);
            *counter += 1;
            if !self.names.contains_key(&name) {
                return name;
            }
        }
    }

    /// Add one element. Unnamed elements get `<kind><n>`.
    pub fn add(&mut self, name: Option<&str>, element: Element) -> Result<StageId> {
        let kind = element.kind();
        let name = match name {
            Some(name) if self.names.contains_key(name) => {
                return Err(Error::config(format!("stage name {} already in graph", name)));
            }
            Some(name) => name.to_string(),
            None => self.auto_name(kind),
        };

        let body = match element {
            Element::Source(source) => {
                if self.head.is_some() {
                    return Err(Error::config(format!(
                        "{}: graph already has a source",
                        name
                    )));
                }
                let caps = source.output_caps();
                self.source = Some(source);
                Body::Source { caps }
            }
            Element::Stage(stage) => Body::Stage(Arc::new(Mutex::new(stage))),
        };
        let is_source = matches!(body, Body::Source { .. });

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.node = Some(StageNode {
            name: name.clone(),
            kind,
            body,
            state: RunState::Stopped,
        });
        let id = StageId {
            index,
            generation: slot.generation,
        };

        if is_source {
            self.head = Some(id);
        }
        debug!("StageGraph: added {} ({}) as {}", name, kind, id);
        self.names.insert(name, id);
        Ok(id)
    }

    /// Add every element of `subgraph` and its internal links. On failure
    /// everything added so far is taken out again.
    pub fn add_subgraph(&mut self, subgraph: Subgraph) -> Result<Vec<StageId>> {
        let mut ids = Vec::with_capacity(subgraph.elements.len());
        for (name, element) in subgraph.elements {
            match self.add(name.as_deref(), element) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.discard(&ids);
                    return Err(e);
                }
            }
        }
        for (from, to) in subgraph.links {
            if let Err(e) = self.link_stages(ids[from], ids[to]) {
                self.discard(&ids);
                return Err(e);
            }
        }
        Ok(ids)
    }

    /// Remove stages and retire them, logging failures. Used for rollback.
    pub fn discard(&mut self, ids: &[StageId]) {
        for removed in self.remove_all(ids) {
            let name = removed.name.clone();
            if let Err(e) = removed.retire() {
                warn!("StageGraph: failed to retire {}: {}", name, e);
            }
        }
    }

    /// Take a stage out of the graph together with any links touching it.
    pub fn remove(&mut self, id: StageId) -> Option<RemovedStage> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        self.links.retain(|_, l| l.from != id && l.to != id);
        self.names.remove(&node.name);
        if self.head == Some(id) {
            self.head = None;
            self.source = None;
        }
        debug!("StageGraph: removed {} ({})", node.name, node.kind);

        let stage = match node.body {
            Body::Stage(stage) => Some(stage),
            Body::Source { .. } => None,
        };
        Some(RemovedStage {
            name: node.name,
            stage,
            state: node.state,
        })
    }

    pub fn remove_all(&mut self, ids: &[StageId]) -> Vec<RemovedStage> {
        ids.iter().filter_map(|id| self.remove(*id)).collect()
    }

    /// Caps leaving `id`, looking through pass-through stages.
    pub fn output_caps(&self, id: StageId) -> Caps {
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(node) = self.node(id) else { break };
            let caps = match &node.body {
                Body::Source { caps } => caps.clone(),
                Body::Stage(stage) => stage
                    .lock()
                    .map(|s| s.output_caps())
                    .unwrap_or_default(),
            };
            if !caps.is_any() {
                return caps;
            }
            current = self.link_into(id).and_then(|l| self.link(l)).map(|l| l.from);
        }
        Caps::any()
    }

    /// Connect the output of `from` to the input of `to`.
    pub fn link_stages(&mut self, from: StageId, to: StageId) -> Result<LinkId> {
        let upstream = self
            .node(from)
            .ok_or_else(|| Error::link(format!("no stage {}", from)))?;
        let downstream = self
            .node(to)
            .ok_or_else(|| Error::link(format!("no stage {}", to)))?;

        if from == to {
            return Err(Error::link(format!("{} cannot link to itself", upstream.name)));
        }
        let Body::Stage(target) = &downstream.body else {
            return Err(Error::link(format!("{} has no input", downstream.name)));
        };
        if self.link_into(to).is_some() {
            return Err(Error::link(format!("{} input already linked", downstream.name)));
        }
        let fan_out = match &upstream.body {
            Body::Stage(stage) => stage.lock().map(|s| s.is_junction()).unwrap_or(false),
            Body::Source { .. } => false,
        };
        if !fan_out && !self.links_from(from).is_empty() {
            return Err(Error::link(format!("{} output already linked", upstream.name)));
        }

        let caps = self.output_caps(from);
        let accepted = target.lock().map(|s| s.accepts(&caps)).unwrap_or(false);
        if !accepted {
            return Err(Error::link(format!(
                "{} refused caps {} from {}",
                downstream.name, caps, upstream.name
            )));
        }
        debug!(
            "StageGraph: linked {} -> {} ({})",
            upstream.name, downstream.name, caps
        );

        let id = LinkId(self.next_link);
        self.next_link += 1;
        self.links.insert(
            id,
            Link {
                from,
                to,
                caps,
                barrier: None,
            },
        );
        Ok(id)
    }

    pub fn unlink(&mut self, id: LinkId) -> Option<Link> {
        self.links.remove(&id)
    }

    /// Put a drain barrier on a link. Visible to the data thread after the
    /// next `publish`.
    pub fn install_barrier(&mut self, id: LinkId, barrier: Arc<DrainBarrier>) -> Result<()> {
        let link = self
            .links
            .get_mut(&id)
            .ok_or_else(|| Error::link(format!("no link {:?}", id)))?;
        link.barrier = Some(barrier);
        Ok(())
    }

    /// Build a fresh topology snapshot and hand it to the data thread.
    pub fn publish(&self) {
        let mut nodes = HashMap::with_capacity(self.names.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(node) = &slot.node else { continue };
            let id = StageId {
                index: index as u32,
                generation: slot.generation,
            };
            let stage = match &node.body {
                Body::Stage(stage) => Some(stage.clone()),
                Body::Source { .. } => None,
            };
            nodes.insert(
                id,
                TopoNode {
                    name: node.name.clone(),
                    stage,
                    outputs: Vec::new(),
                },
            );
        }
        for link in self.links.values() {
            if let Some(node) = nodes.get_mut(&link.from) {
                node.outputs.push(TopoLink {
                    to: link.to,
                    barrier: link.barrier.clone(),
                });
            }
        }
        self.topology.send_replace(Arc::new(Topology { nodes }));
    }

    /// Move the graph to `target`, walking through intermediate states.
    ///
    /// The data thread acknowledges each step only between items, so once a
    /// `Paused` step completes no frame is in flight.
    pub async fn set_state(&mut self, target: RunState) -> StateChange {
        for step in self.state.path_to(target) {
            if let Err(e) = self.step(step).await {
                error!("StageGraph: transition {} -> {} failed: {}", self.state, step, e);
                return StateChange {
                    ok: false,
                    state: self.state,
                    pending: Some(step),
                };
            }
            debug!("StageGraph: {} -> {}", self.state, step);
            self.state = step;
        }
        StateChange {
            ok: true,
            state: self.state,
            pending: None,
        }
    }

    async fn step(&mut self, step: RunState) -> Result<()> {
        match (self.state, step) {
            (RunState::Stopped, RunState::Paused) => {
                self.drive_stages(RunState::Paused)?;
                self.publish();
                self.start_flow()?;
                self.flow_to(RunState::Paused).await
            }
            (RunState::Paused, RunState::Running) => {
                self.drive_stages(RunState::Running)?;
                self.flow_to(RunState::Running).await
            }
            (RunState::Running, RunState::Paused) => {
                self.flow_to(RunState::Paused).await?;
                self.drive_stages(RunState::Paused)
            }
            (RunState::Paused, RunState::Stopped) => {
                let flow = self.flow_to(RunState::Stopped).await;
                if let Some(handle) = self.flow.take() {
                    handle.join().await;
                }
                let stages = self.drive_stages(RunState::Stopped);
                flow.and(stages)
            }
            (from, to) => Err(Error::StateTransition {
                target: to,
                reached: from,
                pending: None,
            }),
        }
    }

    /// Bring stages added since the last transition up to the graph's state.
    pub fn sync_stage_states(&mut self) -> Result<()> {
        self.drive_stages(self.state)
    }

    fn start_flow(&mut self) -> Result<()> {
        let Some(head) = self.head else {
            return Ok(());
        };
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::stage("source already consumed by an earlier run"))?;
        let name = self.name_of(head).unwrap_or("source").to_string();
        info!("StageGraph: starting data flow from {}", name);
        self.flow = Some(FlowHandle::spawn(
            source,
            head,
            name,
            self.topology.subscribe(),
            self.bus.clone(),
            self.stats.clone(),
        ));
        Ok(())
    }

    async fn flow_to(&mut self, target: RunState) -> Result<()> {
        match self.flow.as_mut() {
            Some(flow) => flow.request(target).await,
            None => Ok(()),
        }
    }

    /// Step every stage whose own state differs from `target`.
    fn drive_stages(&mut self, target: RunState) -> Result<()> {
        for slot in self.slots.iter_mut() {
            let Some(node) = slot.node.as_mut() else { continue };
            let stage = match &node.body {
                Body::Stage(stage) => stage,
                Body::Source { .. } => {
                    node.state = target;
                    continue;
                }
            };
            for step in node.state.path_to(target) {
                let mut guard = stage
                    .lock()
                    .map_err(|_| Error::stage(format!("{}: stage lock poisoned", node.name)))?;
                guard
                    .change_state(node.state, step)
                    .map_err(|e| Error::stage(format!("{}: {}", node.name, e)))?;
                node.state = step;
            }
        }
        Ok(())
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StageGraph {
    fn drop(&mut self) {
        if let Some(flow) = self.flow.take() {
            debug!("StageGraph: dropped while {}, aborting data flow", self.state);
            flow.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FrameFeed, Recorder, test_registry};

    fn graph(desc: &str) -> (StageGraph, FrameFeed, Recorder) {
        let recorder = Recorder::default();
        let (registry, feed) = test_registry(&recorder);
        (
            StageGraph::from_description(desc, &registry).unwrap(),
            feed,
            recorder,
        )
    }

    #[test]
    fn test_arena_handles_are_not_reused() {
        let (mut g, _feed, _rec) = graph("appsrc ! tee name=output ! fakesink name=a");
        let a = g.by_name("a").unwrap();
        g.remove(a).unwrap().retire().unwrap();
        assert!(!g.contains(a));

        let registry = StageRegistry::with_builtins();
        let sub = Subgraph::from_description("fakesink name=b", &registry).unwrap();
        let b = g.add_subgraph(sub).unwrap()[0];
        assert_ne!(a, b);
        assert!(g.remove(a).is_none());
        assert_eq!(g.name_of(b), Some("b"));
    }

    #[test]
    fn test_link_rules() {
        let (mut g, _feed, _rec) =
            graph("appsrc ! queue name=q ! fakesink name=s1 fakesink name=s2 tee name=t");
        let q = g.by_name("q").unwrap();
        let s1 = g.by_name("s1").unwrap();
        let s2 = g.by_name("s2").unwrap();
        let t = g.by_name("t").unwrap();
        let src = g.by_name("appsrc0").unwrap();

        // plain stage already feeds s1
        assert!(matches!(g.link_stages(q, s2), Err(Error::Link(_))));
        // s1 input is taken
        assert!(matches!(g.link_stages(t, s1), Err(Error::Link(_))));
        // sources have no input
        assert!(matches!(g.link_stages(t, src), Err(Error::Link(_))));

        // junctions fan out
        let s3 = g
            .add(Some("s3"), crate::stages::fakesink())
            .unwrap();
        g.link_stages(t, s2).unwrap();
        g.link_stages(t, s3).unwrap();
        assert_eq!(g.links_from(t).len(), 2);
    }

    #[test]
    fn test_caps_refused() {
        let registry = StageRegistry::with_builtins();
        let mut g = StageGraph::from_description(
            "jpegenc name=enc motioncells name=m",
            &registry,
        )
        .unwrap();
        let enc = g.by_name("enc").unwrap();
        let m = g.by_name("m").unwrap();
        assert_eq!(g.output_caps(enc).media_type(), Some("image/jpeg"));
        assert!(matches!(g.link_stages(enc, m), Err(Error::Link(_))));
    }

    #[test]
    fn test_failed_subgraph_leaves_nothing_behind() {
        let (mut g, _feed, _rec) = graph("appsrc ! tee name=output");
        let before = g.stage_count();
        let registry = StageRegistry::with_builtins();
        // second element's input gets linked twice
        let sub = Subgraph::from_description("queue name=x ! fakesink name=y x. ! y.", &registry)
            .unwrap();
        assert!(g.add_subgraph(sub).is_err());
        assert_eq!(g.stage_count(), before);
        assert!(g.by_name("x").is_none());
    }

    #[tokio::test]
    async fn test_set_state_runs_frames_through() {
        let (mut g, feed, recorder) = graph("appsrc ! tee name=output ! fakesink name=sink");

        let change = g.set_state(RunState::Running).await;
        assert_eq!(change.verify(RunState::Running).unwrap(), RunState::Running);
        assert_eq!(recorder.states("sink"), vec![RunState::Paused, RunState::Running]);

        feed.push(1);
        feed.push(2);
        crate::testing::wait_for(|| g.stats().frames_consumed() == 2).await;

        let change = g.set_state(RunState::Stopped).await;
        assert!(change.ok);
        assert_eq!(
            recorder.states("sink"),
            vec![
                RunState::Paused,
                RunState::Running,
                RunState::Paused,
                RunState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_stage_refusing_state_reports_failure() {
        let (mut g, _feed, recorder) = graph("appsrc ! tee name=output ! fakesink name=sink");
        recorder.refuse_start("sink");

        let change = g.set_state(RunState::Running).await;
        assert!(!change.ok);
        assert_eq!(change.state, RunState::Stopped);
        assert_eq!(change.pending, Some(RunState::Paused));
        assert!(matches!(
            change.verify(RunState::Running),
            Err(Error::StateTransition { .. })
        ));
    }
}
