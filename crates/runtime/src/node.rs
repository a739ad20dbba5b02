//! Node capabilities and the node map
//!
//! The runtime treats nodes as opaque handles behind the [`PipeNode`]
//! trait and borrows the caller-owned [`NodeMap`] for the duration of a
//! run. Everything the executor needs from a node is in the capability
//! set below; the runtime never downcasts.

use std::any::Any;

use indexmap::IndexMap;

use crate::error::NodeError;
use crate::progress::ProgressHandle;
use crate::types::{DatastructureSpec, NodeId, NodeState, Relation, ResourceKind, UNBOUNDED};

/// Capability set the runtime requires from a pipeline node.
///
/// Lifecycle callbacks may fail; a failure aborts the run without
/// calling `end` on the phase that already called `begin`.
pub trait PipeNode {
    fn id(&self) -> NodeId;
    fn name(&self) -> String;

    /// Priority of this node's name when naming its phase.
    fn name_priority(&self) -> i32 {
        0
    }

    fn phase_name(&self) -> String {
        String::new()
    }

    fn phase_name_priority(&self) -> i32 {
        0
    }

    fn minimum_resource_usage(&self, _kind: ResourceKind) -> u64 {
        0
    }

    fn maximum_resource_usage(&self, _kind: ResourceKind) -> u64 {
        UNBOUNDED
    }

    fn resource_fraction(&self, _kind: ResourceKind) -> f64 {
        0.0
    }

    /// Persistent data structures this node shares across phases.
    fn datastructures(&self) -> IndexMap<String, DatastructureSpec> {
        IndexMap::new()
    }

    /// Number of progress steps this node expects to report.
    fn steps(&self) -> u64 {
        0
    }

    /// Whether this node can spill its in-memory state to disk so a
    /// later phase may reuse its memory.
    fn can_evacuate(&self) -> bool {
        false
    }

    fn evacuate(&mut self) {}

    fn prepare(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn propagate(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn begin(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn go(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn end(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    fn set_state(&mut self, _state: NodeState) {}

    fn set_progress_indicator(&mut self, _pi: Option<ProgressHandle>) {}

    fn set_resource_being_assigned(&mut self, _kind: Option<ResourceKind>) {}

    /// Receive the amount of a resource assigned to this node for the
    /// current phase.
    fn set_available_of_resource(&mut self, kind: ResourceKind, amount: u64);
}

/// Memory slot for one persistent data structure.
///
/// The assigned byte count survives the structure itself; freeing a
/// structure drops the payload and keeps the assignment on record.
pub struct DatastructureSlot {
    pub assigned: u64,
    pub payload: Option<Box<dyn Any>>,
}

/// Caller-owned store of nodes and their relations.
///
/// Iteration follows insertion order, which makes phase numbering and
/// every derived ordering stable across runs.
#[derive(Default)]
pub struct NodeMap {
    nodes: IndexMap<NodeId, Box<dyn PipeNode>>,
    relations: Vec<(NodeId, NodeId, Relation)>,
    datastructures: IndexMap<String, DatastructureSlot>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node under its own id. A later insert with the same id
    /// replaces the earlier node.
    pub fn insert(&mut self, node: Box<dyn PipeNode>) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&dyn PipeNode> {
        self.nodes.get(&id).map(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut (dyn PipeNode + 'static)> {
        self.nodes.get_mut(&id).map(|n| n.as_mut())
    }

    /// Look up a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not in the map.
    pub fn node(&self, id: NodeId) -> &dyn PipeNode {
        self.get(id).expect("unknown node id")
    }

    /// Look up a node mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not in the map.
    pub fn node_mut(&mut self, id: NodeId) -> &mut (dyn PipeNode + 'static) {
        self.get_mut(id).expect("unknown node id")
    }

    /// All node ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Record a relation. Both endpoints must already be in the map.
    pub fn add_relation(&mut self, from: NodeId, to: NodeId, relation: Relation) {
        self.relations.push((from, to, relation));
    }

    /// All relations in insertion order.
    pub fn relations(&self) -> &[(NodeId, NodeId, Relation)] {
        &self.relations
    }

    /// Relations declared by `from`, in insertion order.
    pub fn relations_from(&self, from: NodeId) -> impl Iterator<Item = (NodeId, Relation)> + '_ {
        self.relations
            .iter()
            .filter(move |(f, _, _)| *f == from)
            .map(|&(_, to, rel)| (to, rel))
    }

    /// Number of relations of the given kind pointing at `id`.
    pub fn in_degree(&self, id: NodeId, relation: Relation) -> usize {
        self.relations
            .iter()
            .filter(|&&(_, to, rel)| to == id && rel == relation)
            .count()
    }

    /// Resolve the authoritative map. A standalone map is its own
    /// authority; builders that merge maps resolve through here.
    pub fn find_authority(&self) -> &NodeMap {
        self
    }

    /// Persistent data-structure memory slots.
    pub fn datastructures(&self) -> &IndexMap<String, DatastructureSlot> {
        &self.datastructures
    }

    pub fn datastructures_mut(&mut self) -> &mut IndexMap<String, DatastructureSlot> {
        &mut self.datastructures
    }
}
