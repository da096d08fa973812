//! Live attach and detach of output branches
//!
//! Every structural change follows the same fence: the graph is paused (the
//! data task acknowledges only between frames, so nothing is in flight), the
//! arena is edited, the topology is republished, and the graph is resumed.
//! A failed attach removes whatever it added and resumes before reporting.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::branches::{self, BranchCatalog};
use crate::error::{Error, Result};
use crate::pipeline::barrier::DrainBarrier;
use crate::pipeline::describe;
use crate::pipeline::graph::{LinkId, StageGraph, StageId, Subgraph};
use crate::pipeline::registry::StageRegistry;
use crate::pipeline::state::RunState;

/// A branch that is structurally part of the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHandle {
    pub name: String,
    pub stages: Vec<StageId>,
    /// Junction output feeding the branch input
    pub link: LinkId,
}

pub struct TopologyController {
    junction: String,
    catalog: BranchCatalog,
    registry: StageRegistry,
    table: BTreeMap<String, BranchHandle>,
    barriers: HashMap<String, Arc<DrainBarrier>>,
    detaches: u64,
}

impl TopologyController {
    pub fn new(junction: impl Into<String>, catalog: BranchCatalog, registry: StageRegistry) -> Self {
        Self {
            junction: junction.into(),
            catalog,
            registry,
            table: BTreeMap::new(),
            barriers: HashMap::new(),
            detaches: 0,
        }
    }

    /// Names of attached branches, sorted
    pub fn attachments(&self) -> Vec<String> {
        self.table.keys().cloned().collect()
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn handle(&self, name: &str) -> Option<&BranchHandle> {
        self.table.get(name)
    }

    pub fn barrier(&self, name: &str) -> Option<&Arc<DrainBarrier>> {
        self.barriers.get(name)
    }

    /// Completed detaches since creation
    pub fn detaches(&self) -> u64 {
        self.detaches
    }

    /// Attach branch `name` to the junction of a running graph.
    ///
    /// With `stay_paused` the graph is left paused afterwards; the caller
    /// must [`resume`](Self::resume) it.
    pub async fn attach(
        &mut self,
        graph: &mut StageGraph,
        name: &str,
        params: &HashMap<String, String>,
        stay_paused: bool,
    ) -> Result<BranchHandle> {
        if self.table.contains_key(name) {
            return Err(Error::AlreadyAttached(name.to_string()));
        }
        if !graph.state().is_running() {
            return Err(Error::NotRunning);
        }
        let description = self.catalog.resolve(name, params)?;

        Self::pause(graph).await?;

        let handle = match self.insert(graph, name, &description) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("TopologyController: attach {} failed: {}", name, e);
                Self::restore(graph).await;
                return Err(e);
            }
        };

        if !stay_paused {
            if let Err(e) = Self::resume(graph).await {
                warn!("TopologyController: {} attached but graph did not resume: {}", name, e);
                Self::rollback(graph, &handle.stages);
                return Err(e);
            }
        }

        info!(
            "TopologyController: attached {} ({} stages){}",
            name,
            handle.stages.len(),
            if stay_paused { ", graph held paused" } else { "" }
        );
        self.table.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Build, add and link the branch, then publish. Leaves nothing behind
    /// on failure.
    fn insert(&self, graph: &mut StageGraph, name: &str, description: &str) -> Result<BranchHandle> {
        let parsed = describe::parse(description)?;
        let input = branches::input_name(name);
        if parsed.position(&input).is_none() {
            return Err(Error::config(format!(
                "branch {} does not declare {}",
                name, input
            )));
        }
        let junction = graph
            .by_name(&self.junction)
            .ok_or_else(|| Error::link(format!("no junction {} in graph", self.junction)))?;

        let stages = graph.add_subgraph(Subgraph::instantiate(&parsed, &self.registry)?)?;
        let linked = graph
            .by_name(&input)
            .ok_or_else(|| Error::link(format!("{} missing after add", input)))
            .and_then(|input| graph.link_stages(junction, input))
            .and_then(|link| graph.sync_stage_states().map(|_| link));

        match linked {
            Ok(link) => {
                graph.publish();
                Ok(BranchHandle {
                    name: name.to_string(),
                    stages,
                    link,
                })
            }
            Err(e) => {
                Self::rollback(graph, &stages);
                Err(e)
            }
        }
    }

    fn rollback(graph: &mut StageGraph, stages: &[StageId]) {
        debug!("TopologyController: rolling back {} stages", stages.len());
        graph.discard(stages);
        graph.publish();
    }

    /// Remove branch `name`. Absent branches are left alone and `false` is
    /// returned.
    pub async fn detach(&mut self, graph: &mut StageGraph, name: &str) -> Result<bool> {
        let Some(handle) = self.table.get(name).cloned() else {
            debug!("TopologyController: detach {}: not attached", name);
            return Ok(false);
        };

        if graph.state().is_running() {
            Self::pause(graph).await?;
        }

        graph.unlink(handle.link);
        let removed = graph.remove_all(&handle.stages);
        graph.publish();
        for stage in removed {
            let stage_name = stage.name.clone();
            if let Err(e) = stage.retire() {
                warn!("TopologyController: {} did not stop cleanly: {}", stage_name, e);
            }
        }

        self.table.remove(name);
        if let Some(barrier) = self.barriers.remove(name) {
            barrier.resolve();
        }
        self.detaches += 1;
        info!("TopologyController: detached {}", name);

        // also releases a graph held paused by a snapshot attach
        if graph.state().is_paused() {
            Self::resume(graph).await?;
        }
        Ok(true)
    }

    /// Install `barrier` on `link` of branch `name` and republish.
    pub fn arm(
        &mut self,
        graph: &mut StageGraph,
        name: &str,
        link: LinkId,
        barrier: Arc<DrainBarrier>,
    ) -> Result<()> {
        if !self.table.contains_key(name) {
            return Err(Error::config(format!("branch {} is not attached", name)));
        }
        graph.install_barrier(link, barrier.clone())?;
        graph.publish();
        self.barriers.insert(name.to_string(), barrier);
        debug!("TopologyController: barrier armed on {}", name);
        Ok(())
    }

    /// Forget every attachment. For use once the graph has been stopped.
    pub fn clear(&mut self) {
        for (_, barrier) in self.barriers.drain() {
            barrier.resolve();
        }
        self.table.clear();
    }

    pub async fn resume(graph: &mut StageGraph) -> Result<()> {
        graph
            .set_state(RunState::Running)
            .await
            .verify(RunState::Running)
            .map(|_| ())
    }

    async fn pause(graph: &mut StageGraph) -> Result<()> {
        graph
            .set_state(RunState::Paused)
            .await
            .verify(RunState::Paused)
            .map(|_| ())
    }

    async fn restore(graph: &mut StageGraph) {
        if let Err(e) = Self::resume(graph).await {
            warn!("TopologyController: could not restore running state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FrameFeed, Recorder, test_registry, wait_for};
    use tokio::sync::mpsc;

    struct Fixture {
        graph: StageGraph,
        topo: TopologyController,
        feed: FrameFeed,
        recorder: Recorder,
    }

    async fn fixture() -> Fixture {
        let recorder = Recorder::default();
        let (registry, feed) = test_registry(&recorder);
        let overrides = HashMap::from([
            (
                branches::LIVE.to_string(),
                "queue name=live-input ! fakesink name=live-sink".to_string(),
            ),
            (
                branches::SNAPSHOT.to_string(),
                "queue name=snapshot-input ! filesink name=snapshot-filesink \
                 location={snapshot_output}"
                    .to_string(),
            ),
            (
                "picky".to_string(),
                "picky name=picky-input ! fakesink name=picky-sink".to_string(),
            ),
            ("headless".to_string(), "fakesink name=headless-sink".to_string()),
        ]);

        let mut graph = StageGraph::from_description(
            "appsrc ! tee name=output ! fakesink name=main",
            &registry,
        )
        .unwrap();
        assert!(graph.set_state(RunState::Running).await.ok);

        let topo = TopologyController::new(
            branches::DEFAULT_JUNCTION,
            BranchCatalog::new(&overrides),
            registry,
        );
        Fixture {
            graph,
            topo,
            feed,
            recorder,
        }
    }

    fn snapshot_params() -> HashMap<String, String> {
        HashMap::from([(branches::SNAPSHOT_OUTPUT.to_string(), "/tmp/x".to_string())])
    }

    #[tokio::test]
    async fn test_attach_once_per_name() {
        let mut f = fixture().await;
        let none = HashMap::new();

        f.topo
            .attach(&mut f.graph, branches::LIVE, &none, false)
            .await
            .unwrap();
        assert_eq!(f.graph.state(), RunState::Running);
        assert_eq!(
            f.recorder.states("live-sink"),
            vec![RunState::Paused, RunState::Running]
        );

        let again = f.topo.attach(&mut f.graph, branches::LIVE, &none, false).await;
        assert!(matches!(again, Err(Error::AlreadyAttached(_))));
        assert_eq!(f.topo.attachments(), vec![branches::LIVE.to_string()]);
        assert_eq!(f.graph.state(), RunState::Running);

        f.feed.push(1);
        wait_for(|| f.recorder.frames("live-sink") == 1).await;
        assert_eq!(f.recorder.frames("main"), 1);
    }

    #[tokio::test]
    async fn test_detach_absent_is_noop() {
        let mut f = fixture().await;
        let stages = f.graph.stage_count();

        assert!(!f.topo.detach(&mut f.graph, branches::LIVE).await.unwrap());
        assert_eq!(f.graph.state(), RunState::Running);
        assert_eq!(f.graph.stage_count(), stages);
        assert_eq!(f.topo.detaches(), 0);
    }

    #[tokio::test]
    async fn test_detach_stops_and_removes_branch() {
        let mut f = fixture().await;
        let stages = f.graph.stage_count();
        f.topo
            .attach(&mut f.graph, branches::LIVE, &HashMap::new(), false)
            .await
            .unwrap();
        assert_eq!(f.graph.stage_count(), stages + 2);

        assert!(f.topo.detach(&mut f.graph, branches::LIVE).await.unwrap());
        assert_eq!(f.graph.state(), RunState::Running);
        assert_eq!(f.graph.stage_count(), stages);
        assert!(f.topo.attachments().is_empty());
        assert_eq!(f.recorder.states("live-sink").last(), Some(&RunState::Stopped));

        // backbone keeps flowing
        f.feed.push(1);
        wait_for(|| f.recorder.frames("main") == 1).await;
        assert_eq!(f.recorder.frames("live-sink"), 0);
    }

    #[tokio::test]
    async fn test_failed_link_rolls_back() {
        let mut f = fixture().await;
        let stages = f.graph.stage_count();
        let links = f.graph.link_count();

        f.recorder.refuse_links(true);
        let result = f.topo.attach(&mut f.graph, "picky", &HashMap::new(), false).await;
        assert!(matches!(result, Err(Error::Link(_))));
        assert_eq!(f.graph.state(), RunState::Running);
        assert_eq!(f.graph.stage_count(), stages);
        assert_eq!(f.graph.link_count(), links);
        assert!(f.graph.by_name("picky-sink").is_none());
        assert!(!f.topo.is_attached("picky"));

        f.recorder.refuse_links(false);
        f.topo
            .attach(&mut f.graph, "picky", &HashMap::new(), false)
            .await
            .unwrap();
        assert!(f.topo.is_attached("picky"));
    }

    #[tokio::test]
    async fn test_config_errors_leave_graph_running() {
        let mut f = fixture().await;
        let none = HashMap::new();

        let unknown = f.topo.attach(&mut f.graph, "thermal", &none, false).await;
        assert!(matches!(unknown, Err(Error::Configuration(_))));

        let missing = f.topo.attach(&mut f.graph, branches::SNAPSHOT, &none, false).await;
        assert!(matches!(missing, Err(Error::Configuration(_))));

        let headless = f.topo.attach(&mut f.graph, "headless", &none, false).await;
        assert!(matches!(headless, Err(Error::Configuration(_))));

        assert_eq!(f.graph.state(), RunState::Running);
        assert!(f.topo.attachments().is_empty());
    }

    #[tokio::test]
    async fn test_barrier_drains_one_frame_then_detaches() {
        let mut f = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = f
            .topo
            .attach(&mut f.graph, branches::SNAPSHOT, &snapshot_params(), true)
            .await
            .unwrap();
        assert_eq!(f.graph.state(), RunState::Paused);

        let sink = f.graph.by_name(branches::SNAPSHOT_SINK).unwrap();
        let link = f.graph.link_into(sink).unwrap();
        assert_ne!(link, handle.link);
        let barrier = Arc::new(DrainBarrier::after_items(1, move || {
            let _ = tx.send(branches::SNAPSHOT);
        }));
        f.topo
            .arm(&mut f.graph, branches::SNAPSHOT, link, barrier.clone())
            .unwrap();
        TopologyController::resume(&mut f.graph).await.unwrap();

        for seq in 0..5 {
            f.feed.push(seq);
        }
        let name = rx.recv().await.unwrap();
        assert!(f.topo.detach(&mut f.graph, name).await.unwrap());

        assert_eq!(f.recorder.frames(branches::SNAPSHOT_SINK), 1);
        assert!(barrier.state().armed);
        assert!(barrier.state().resolved);
        assert!(f.topo.barrier(branches::SNAPSHOT).is_none());
        assert_eq!(f.topo.detaches(), 1);
        assert_eq!(f.graph.state(), RunState::Running);
    }
}
