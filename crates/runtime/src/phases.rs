//! Phase partitioning
//!
//! Groups nodes into phases with a union-find over non-dependency
//! relations, colors cross-phase dependencies, and orders the phases so
//! that every mandatory memory-share adjacency holds and as many
//! optional ones as possible are satisfied.

use indexmap::{IndexMap, IndexSet};
use tracing::debug;
use union_find::{QuickUnionUf, UnionBySize, UnionFind};

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::node::NodeMap;
use crate::order::{SatisfiableGraph, Strategy};
use crate::types::{NodeId, Relation};

/// Assign each node a dense phase index.
///
/// Two nodes share a phase iff they are joined by any chain of
/// non-dependency relations. Phase indices are dense, in first-seen
/// order over node-map iteration.
pub fn phase_map(map: &NodeMap) -> IndexMap<NodeId, usize> {
    let ids: Vec<NodeId> = map.ids().collect();
    let index: IndexMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut union = QuickUnionUf::<UnionBySize>::new(ids.len());
    for &(from, to, relation) in map.relations() {
        if !relation.is_dependency() {
            union.union(index[&from], index[&to]);
        }
    }

    let mut phase_of_root: IndexMap<usize, usize> = IndexMap::default();
    let mut result = IndexMap::default();
    for (i, &id) in ids.iter().enumerate() {
        let root = union.find(i);
        let next = phase_of_root.len();
        let phase = *phase_of_root.entry(root).or_insert(next);
        result.insert(id, phase);
    }
    result
}

/// Phase-level dependency graph: one edge producer-phase to
/// consumer-phase per cross-phase dependency relation.
pub fn phase_graph(map: &NodeMap, phase_map: &IndexMap<NodeId, usize>) -> Graph<usize> {
    let mut graph = Graph::new();
    for &phase in phase_map.values() {
        graph.add_node(phase);
    }
    for &(from, to, relation) in map.relations() {
        if relation.is_dependency() {
            graph.add_edge(phase_map[&to], phase_map[&from]);
        }
    }
    graph
}

/// Order phases and compute the evacuation set.
///
/// Cross-phase dependencies are colored black (plain), red (memory
/// share, producer can evacuate) or green (memory share, producer
/// cannot evacuate). Green edges must be satisfied: their phases are
/// contracted into meta-phases whose internal order is forced by the
/// green chain, red edges become satisfiable edges of the contracted
/// graph, and any failure to order is a green-edge infeasibility.
///
/// Returns the phases in execution order, each as its node list in
/// node-map iteration order, plus the ids of nodes that must be
/// evacuated once their phase is no longer the most recent one.
pub fn ordered_phases(
    map: &NodeMap,
    phase_map: &IndexMap<NodeId, usize>,
    phase_graph: &Graph<usize>,
) -> Result<(Vec<Vec<NodeId>>, IndexSet<NodeId>)> {
    let mut black_edges: Vec<(usize, usize)> = Vec::new();
    let mut red_edges: Vec<(usize, usize)> = Vec::new();
    let mut green_edges: IndexMap<usize, usize> = IndexMap::default();
    let mut rev_green_edges: IndexMap<usize, usize> = IndexMap::default();

    for &(from, to, relation) in map.relations() {
        if !relation.is_dependency() {
            continue;
        }
        let producer_phase = phase_map[&to];
        let consumer_phase = phase_map[&from];
        if producer_phase == consumer_phase {
            continue;
        }

        if relation != Relation::MemoryShareDepends {
            debug!(from = producer_phase, to = consumer_phase, "black phase edge");
            black_edges.push((producer_phase, consumer_phase));
        } else if map.node(to).can_evacuate() {
            debug!(from = producer_phase, to = consumer_phase, "red phase edge");
            red_edges.push((producer_phase, consumer_phase));
        } else {
            debug!(from = producer_phase, to = consumer_phase, "green phase edge");
            // Two green edges sharing a head or a tail can't both be
            // satisfied, and all of them must be.
            if green_edges.contains_key(&producer_phase)
                || rev_green_edges.contains_key(&consumer_phase)
            {
                return Err(Error::GreenEdgesUnsatisfiable);
            }
            green_edges.insert(producer_phase, consumer_phase);
            rev_green_edges.insert(consumer_phase, producer_phase);
        }
    }

    // Contract green endpoints into meta-phases. Inside one meta-phase
    // the green edges form a simple path whose order is forced.
    let mut contraction = QuickUnionUf::<UnionBySize>::new(phase_graph.len());
    for (&a, &b) in &green_edges {
        contraction.union(a, b);
    }

    let mut green_chains: IndexMap<usize, Graph<usize>> = IndexMap::default();
    for (&a, &b) in &green_edges {
        let root = contraction.find(a);
        green_chains.entry(root).or_default().add_edge(a, b);
    }

    let mut contracted = SatisfiableGraph::new();
    for phase in phase_graph.nodes() {
        contracted.add_node(contraction.find(phase));
    }

    // Red edges dominate: a meta-pair connected by both colors is
    // treated as satisfiable.
    let mut red_set: IndexSet<(usize, usize)> = IndexSet::default();
    for &(a, b) in &red_edges {
        let pair = (contraction.find(a), contraction.find(b));
        if pair.0 != pair.1 {
            red_set.insert(pair);
        }
    }
    let mut black_set: IndexSet<(usize, usize)> = IndexSet::default();
    for &(a, b) in &black_edges {
        let pair = (contraction.find(a), contraction.find(b));
        if pair.0 != pair.1 && !red_set.contains(&pair) {
            black_set.insert(pair);
        }
    }
    for &(a, b) in &black_set {
        contracted.add_edge(a, b, false);
    }
    for &(a, b) in &red_set {
        contracted.add_edge(a, b, true);
    }
    debug!(plot = %contracted.plot(), "contracted phase graph");

    let mut order = contracted
        .topological_order(Strategy::Auto)
        .map_err(|_| Error::GreenEdgesUnsatisfiable)?;

    // Expand each meta-phase into its internal green path.
    for (root, chain) in &green_chains {
        let path = chain
            .topological_order()
            .map_err(|_| Error::GreenEdgesUnsatisfiable)?;
        let pos = order
            .iter()
            .position(|x| x == root)
            .expect("contracted phase missing from order");
        order[pos] = *path.last().expect("empty green chain");
        order.splice(pos..pos, path[..path.len() - 1].iter().copied());
    }

    // order[i] is the i-th phase to run; invert so that
    // execution_slot[phase] is the time at which it runs.
    let execution_slot = inverse_permutation(&order)?;

    let mut phases: Vec<Vec<NodeId>> = vec![Vec::new(); order.len()];
    for (&id, &phase) in phase_map {
        phases[execution_slot[phase]].push(id);
    }

    // A memory-share producer whose consumer does not sit in the phase
    // immediately after its own must spill once its phase is done.
    let mut evacuate_when_done: IndexSet<NodeId> = IndexSet::default();
    let mut previous_nodes: IndexSet<NodeId> = IndexSet::default();
    for phase in &phases {
        for &id in phase {
            for (producer, relation) in map.relations_from(id) {
                if relation != Relation::MemoryShareDepends {
                    continue;
                }
                if previous_nodes.contains(&producer) {
                    continue;
                }
                evacuate_when_done.insert(producer);
            }
        }
        previous_nodes = phase.iter().copied().collect();
    }

    Ok((phases, evacuate_when_done))
}

/// Display name for a phase: the nonempty `phase_name` of the highest
/// `phase_name_priority` node, else the `name` of the highest
/// `name_priority` node.
pub fn phase_name(map: &NodeMap, phase: &[NodeId]) -> String {
    let mut named: Option<(i32, NodeId)> = None;
    for &id in phase {
        let node = map.node(id);
        if node.phase_name().is_empty() {
            continue;
        }
        let priority = node.phase_name_priority();
        if named.is_none_or(|(best, _)| priority > best) {
            named = Some((priority, id));
        }
    }
    if let Some((_, id)) = named {
        return map.node(id).phase_name();
    }

    let mut fallback: Option<(i32, NodeId)> = None;
    for &id in phase {
        let priority = map.node(id).name_priority();
        if fallback.is_none_or(|(best, _)| priority > best) {
            fallback = Some((priority, id));
        }
    }
    match fallback {
        Some((_, id)) => map.node(id).name(),
        None => String::new(),
    }
}

/// Invert a permutation of `0..n`, verifying that it is one.
pub(crate) fn inverse_permutation(f: &[usize]) -> Result<Vec<usize>> {
    let n = f.len();
    let mut result = vec![n; n];
    for (i, &fi) in f.iter().enumerate() {
        if fi >= n {
            return Err(Error::MalformedPermutation {
                reason: "value out of range",
            });
        }
        if result[fi] != n {
            return Err(Error::MalformedPermutation {
                reason: "not injective",
            });
        }
        result[fi] = i;
    }
    if result.iter().any(|&slot| slot == n) {
        return Err(Error::MalformedPermutation {
            reason: "not surjective",
        });
    }
    Ok(result)
}
