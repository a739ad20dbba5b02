//! Pipeline executor
//!
//! Drives phases through the prepare/propagate/begin/go/end lifecycle,
//! with per-phase resource assignment, evacuation of memory-share
//! producers, and progress wiring around every phase.

use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::error::{Error, NodeError, Result};
use crate::graph::Graph;
use crate::node::NodeMap;
use crate::phases;
use crate::progress::{
    combine_name_hash, PhaseProgress, ProgressHandle, RunProgress, SourceLocation,
};
use crate::resources::{self, DatastructureRuntime};
use crate::types::{NodeId, NodeState, Relation};

/// Pipeline runtime borrowing a caller-owned node map for one run.
pub struct Runtime<'a> {
    node_map: &'a mut NodeMap,
}

/// Transient per-run state, handed out by [`Runtime::go_init`] and
/// consumed by [`Runtime::go_until`]. Dropping it terminates execution;
/// progress indicators of an unfinished run emit no completion.
pub struct GoContext {
    phases: Vec<Vec<NodeId>>,
    evacuate_when_done: IndexSet<NodeId>,
    item_flow: Vec<Graph<NodeId>>,
    actor: Vec<Graph<NodeId>>,
    drt: DatastructureRuntime,
    progress: RunProgress,
    next_phase: usize,
    files: u64,
    memory: u64,
    phase_progress: Option<PhaseProgress>,
}

impl GoContext {
    /// Phases in execution order.
    pub fn phases(&self) -> &[Vec<NodeId>] {
        &self.phases
    }

    /// Nodes that are spilled once their phase stops being the most
    /// recent one.
    pub fn evacuate_when_done(&self) -> &IndexSet<NodeId> {
        &self.evacuate_when_done
    }
}

impl<'a> Runtime<'a> {
    pub fn new(node_map: &'a mut NodeMap) -> Self {
        Self { node_map }
    }

    pub fn node_count(&self) -> usize {
        self.node_map.len()
    }

    /// Nodes nothing pushes to, pulls from or depends on.
    pub fn item_sources(&self) -> Vec<NodeId> {
        let mut possible: IndexSet<NodeId> = self.node_map.ids().collect();
        for &(from, to, relation) in self.node_map.relations() {
            match relation {
                Relation::Pushes => {
                    possible.shift_remove(&to);
                }
                Relation::Pulls
                | Relation::Depends
                | Relation::NoForwardDepends
                | Relation::MemoryShareDepends => {
                    possible.shift_remove(&from);
                }
            }
        }
        possible.into_iter().collect()
    }

    /// Nodes that push to, pull from or depend on nothing.
    pub fn item_sinks(&self) -> Vec<NodeId> {
        let mut possible: IndexSet<NodeId> = self.node_map.ids().collect();
        for &(from, to, relation) in self.node_map.relations() {
            match relation {
                Relation::Pushes => {
                    possible.shift_remove(&from);
                }
                Relation::Pulls
                | Relation::Depends
                | Relation::NoForwardDepends
                | Relation::MemoryShareDepends => {
                    possible.shift_remove(&to);
                }
            }
        }
        possible.into_iter().collect()
    }

    /// Run the pipeline to completion.
    pub fn go(
        &mut self,
        items: u64,
        progress: ProgressHandle,
        files: u64,
        memory: u64,
        location: Option<SourceLocation>,
    ) -> Result<()> {
        let mut context = self.go_init(items, progress, files, memory, location)?;
        self.go_until(&mut context, None)
    }

    /// Partition, order, validate, prepare and assign resources; the
    /// returned context drives the phases through [`Runtime::go_until`].
    pub fn go_init(
        &mut self,
        items: u64,
        progress: ProgressHandle,
        files: u64,
        memory: u64,
        location: Option<SourceLocation>,
    ) -> Result<GoContext> {
        if self.node_map.is_empty() {
            return Err(Error::EmptyPipeline);
        }

        let phase_map = phases::phase_map(self.node_map);
        if phase_map.len() != self.node_count() {
            return Err(Error::PhaseMapSize {
                got: phase_map.len(),
                expected: self.node_count(),
            });
        }

        let phase_graph = phases::phase_graph(self.node_map, &phase_map);
        debug!(plot = %phase_graph.plot(), "phase graph");

        let (phase_list, evacuate_when_done) =
            phases::ordered_phases(self.node_map, &phase_map, &phase_graph)?;

        self.ensure_initiators(&phase_list)?;

        let item_flow = self.phase_graphs(&phase_list, true);
        let actor = self.phase_graphs(&phase_list, false);

        self.prepare_all(&item_flow)?;

        let mut drt = DatastructureRuntime::new(self.node_map, &phase_list)?;
        resources::assign_files(self.node_map, &phase_list, files);
        resources::assign_memory(self.node_map, &phase_list, memory, &mut drt);

        let progress = self.init_progress(items, progress, &phase_list, location);

        Ok(GoContext {
            phases: phase_list,
            evacuate_when_done,
            item_flow,
            actor,
            drt,
            progress,
            next_phase: 0,
            files,
            memory,
            phase_progress: None,
        })
    }

    /// Run phases until `target` is reached or the pipeline completes.
    ///
    /// When `target` is in the phase about to run its initiators, the
    /// call returns after `begin` without running `go` or `end`; the
    /// next call ends that phase and continues.
    pub fn go_until(&mut self, context: &mut GoContext, target: Option<NodeId>) -> Result<()> {
        if context.next_phase > context.phases.len() {
            return Ok(());
        }

        if context.next_phase != 0 {
            // Resuming: the previous call left its phase begun but not
            // ended.
            self.end_all(&context.actor[context.next_phase - 1])?;
            if let Some(phase_progress) = context.phase_progress.take() {
                phase_progress.complete();
            }
        }

        while context.next_phase < context.phases.len() {
            let i = context.next_phase;
            debug!(
                phase = %phases::phase_name(self.node_map, &context.phases[i]),
                "running pipeline phase"
            );

            if i > 0 {
                self.evacuate_all(&context.phases[i - 1], &context.evacuate_when_done);
            }

            self.propagate_all(&context.item_flow[i])?;

            resources::reassign_files(self.node_map, &context.phases, i, context.files);
            resources::reassign_memory(self.node_map, &context.phases, i, context.memory, &context.drt);

            let steps = context.phases[i]
                .iter()
                .map(|&id| self.node_map.node(id).steps())
                .sum();
            let phase_progress = PhaseProgress::begin(&context.progress, i, steps);
            self.set_progress_indicators(&context.phases[i], phase_progress.handle());
            context.phase_progress = Some(phase_progress);

            self.begin_all(&context.actor[i])?;

            if let Some(target) = target
                && context.phases[i].contains(&target)
            {
                context.next_phase = i + 1;
                return Ok(());
            }

            self.go_initiators(&context.phases[i])?;
            self.end_all(&context.actor[i])?;

            context.drt.free_datastructures(self.node_map, i);

            if let Some(phase_progress) = context.phase_progress.take() {
                phase_progress.complete();
            }
            context.next_phase = i + 1;
        }

        context.next_phase = context.phases.len() + 1;
        context.progress.complete();
        Ok(())
    }

    /// Whether nothing pushes to or pulls from this node.
    fn is_initiator(&self, id: NodeId) -> bool {
        self.node_map.in_degree(id, Relation::Pushes) == 0
            && self.node_map.in_degree(id, Relation::Pulls) == 0
    }

    fn ensure_initiators(&self, phase_list: &[Vec<NodeId>]) -> Result<()> {
        for phase in phase_list {
            if !phase.iter().any(|&id| self.is_initiator(id)) {
                return Err(Error::MissingInitiator {
                    phase: phases::phase_name(self.node_map, phase),
                });
            }
        }
        Ok(())
    }

    /// Per-phase graphs over pushes and pulls. The item-flow variant
    /// reverses pulls so edges follow the items; the actor variant
    /// keeps both forward.
    fn phase_graphs(&self, phase_list: &[Vec<NodeId>], item_flow: bool) -> Vec<Graph<NodeId>> {
        phase_list
            .iter()
            .map(|phase| {
                let mut graph = Graph::new();
                for &id in phase {
                    graph.add_node(id);
                    for (other, relation) in self.node_map.relations_from(id) {
                        match relation {
                            Relation::Pushes => graph.add_edge(id, other),
                            Relation::Pulls => {
                                if item_flow {
                                    graph.add_edge(other, id);
                                } else {
                                    graph.add_edge(id, other);
                                }
                            }
                            Relation::Depends
                            | Relation::NoForwardDepends
                            | Relation::MemoryShareDepends => {}
                        }
                    }
                }
                graph
            })
            .collect()
    }

    fn lifecycle(
        &mut self,
        id: NodeId,
        stage: &'static str,
        call: impl FnOnce(&mut (dyn crate::node::PipeNode + 'static)) -> std::result::Result<(), NodeError>,
    ) -> Result<()> {
        let node = self.node_map.node_mut(id);
        if let Err(source) = call(node) {
            let name = self.node_map.node(id).name();
            return Err(Error::NodeFailure {
                name,
                stage,
                source,
            });
        }
        Ok(())
    }

    /// Call `prepare` on every node, phase by phase, in item-flow
    /// topological order.
    fn prepare_all(&mut self, item_flow: &[Graph<NodeId>]) -> Result<()> {
        for graph in item_flow {
            for id in graph.topological_order()? {
                self.node_map.node_mut(id).set_state(NodeState::InPrepare);
                self.lifecycle(id, "prepare", |node| node.prepare())?;
                self.node_map.node_mut(id).set_state(NodeState::AfterPrepare);
            }
        }
        Ok(())
    }

    fn propagate_all(&mut self, item_flow: &Graph<NodeId>) -> Result<()> {
        for id in item_flow.topological_order()? {
            self.node_map.node_mut(id).set_state(NodeState::InPropagate);
            self.lifecycle(id, "propagate", |node| node.propagate())?;
            self.node_map
                .node_mut(id)
                .set_state(NodeState::AfterPropagate);
        }
        Ok(())
    }

    /// Call `begin` leaves first: reverse actor topological order.
    fn begin_all(&mut self, actor: &Graph<NodeId>) -> Result<()> {
        let order = actor.topological_order()?;
        for &id in order.iter().rev() {
            self.node_map.node_mut(id).set_state(NodeState::InBegin);
            self.lifecycle(id, "begin", |node| node.begin())?;
            self.node_map.node_mut(id).set_state(NodeState::AfterBegin);
        }
        Ok(())
    }

    /// Call `end` roots first: forward actor topological order.
    fn end_all(&mut self, actor: &Graph<NodeId>) -> Result<()> {
        for id in actor.topological_order()? {
            self.node_map.node_mut(id).set_state(NodeState::InEnd);
            self.lifecycle(id, "end", |node| node.end())?;
            self.node_map.node_mut(id).set_state(NodeState::AfterEnd);
        }
        Ok(())
    }

    fn go_initiators(&mut self, phase: &[NodeId]) -> Result<()> {
        let initiators: Vec<NodeId> = phase
            .iter()
            .copied()
            .filter(|&id| self.is_initiator(id))
            .collect();
        for id in initiators {
            self.node_map.node_mut(id).set_state(NodeState::InGo);
            self.lifecycle(id, "go", |node| node.go())?;
            self.node_map.node_mut(id).set_state(NodeState::AfterBegin);
        }
        Ok(())
    }

    fn evacuate_all(&mut self, phase: &[NodeId], evacuate_when_done: &IndexSet<NodeId>) {
        for &id in phase {
            if !evacuate_when_done.contains(&id) {
                continue;
            }
            if self.node_map.node(id).can_evacuate() {
                self.node_map.node_mut(id).evacuate();
                debug!(node = %id, "evacuated node");
            } else {
                warn!(node = %id, "evacuation needed but node cannot evacuate");
            }
        }
    }

    fn set_progress_indicators(&mut self, phase: &[NodeId], indicator: ProgressHandle) {
        for &id in phase {
            self.node_map
                .node_mut(id)
                .set_progress_indicator(Some(indicator.clone()));
        }
    }

    /// Build the run's progress scaffolding. Each phase gets a stable
    /// id `p{index:03}:{phase_name}:{hash8}`, where `hash8` is the low
    /// 32 bits of an order-sensitive running hash over node names. With
    /// no source location, null indicators keep the execution path
    /// identical.
    fn init_progress(
        &self,
        items: u64,
        sink: ProgressHandle,
        phase_list: &[Vec<NodeId>],
        location: Option<SourceLocation>,
    ) -> RunProgress {
        let Some(location) = location else {
            return RunProgress::null(phase_list.len());
        };

        debug!(
            file = location.file,
            function = location.function,
            "initializing progress"
        );
        let mut uuid = 0u64;
        let mut labels = Vec::with_capacity(phase_list.len());
        for (i, phase) in phase_list.iter().enumerate() {
            for &id in phase {
                uuid = combine_name_hash(uuid, &self.node_map.node(id).name());
            }
            let name = phases::phase_name(self.node_map, phase);
            labels.push(format!("p{i:03}:{name}:{:08X}", uuid & 0xFFFF_FFFF));
        }
        RunProgress::init(items, sink, labels)
    }
}
