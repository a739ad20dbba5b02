//! Satisfiable-edge ordering
//!
//! Computes topological orders that maximize the number of designated
//! satisfiable edges whose endpoints end up adjacent. A node can have at
//! most one satisfied outgoing and one satisfied incoming edge, so the
//! satisfied edges form disjoint chains through the order.

use indexmap::{IndexMap, IndexSet};
use union_find::{QuickUnionUf, UnionBySize, UnionFind};

#[cfg(test)]
use crate::error::Error;
use crate::error::Result;
use crate::graph::Graph;

/// Largest node count for the permutation brute force.
pub const MAX_BRUTEFORCE_DEPTH: usize = 10;

/// Largest satisfiable-edge count for the subset brute force.
pub const MAX_BRUTEFORCE_SATISFIABLE: usize = 18;

/// Ordering strategy. `Auto` picks per subgraph; the rest force one
/// algorithm, mostly for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    BruteforceOrder,
    BruteforceSatisfiable,
    Greedy,
    Auto,
}

/// DAG over dense indices with a designated subset of satisfiable edges.
#[derive(Debug, Clone, Default)]
pub struct SatisfiableGraph {
    graph: Graph<usize>,
    satisfiable: IndexSet<(usize, usize)>,
}

struct OrderResult {
    satisfied: usize,
    order: Vec<usize>,
}

impl SatisfiableGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, u: usize) {
        self.graph.add_node(u);
    }

    pub fn add_edge(&mut self, u: usize, v: usize, satisfiable: bool) {
        self.graph.add_edge(u, v);
        if satisfiable {
            self.satisfiable.insert((u, v));
        }
    }

    pub fn remove_edge(&mut self, u: usize, v: usize) {
        self.graph.remove_edge(u, v);
        self.satisfiable.shift_remove(&(u, v));
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn satisfiable_count(&self) -> usize {
        self.satisfiable.len()
    }

    /// Render the graph in DOT format, satisfiable edges in red.
    pub fn plot(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("digraph {\n");
        for u in self.graph.nodes() {
            let _ = writeln!(out, "{u}");
            for &v in self.graph.edge_list(u) {
                let color = if self.satisfiable.contains(&(u, v)) {
                    " [color=red]"
                } else {
                    ""
                };
                let _ = writeln!(out, "{u} -> {v}{color}");
            }
        }
        out.push('}');
        out
    }

    /// Topological order maximizing satisfied edges (exactly for the
    /// brute-force strategies, heuristically for `Greedy`).
    pub fn topological_order(&mut self, strategy: Strategy) -> Result<Vec<usize>> {
        self.preprocess()?;

        let mut order = Vec::with_capacity(self.len());
        for mut sub in self.split_graph() {
            sub.preprocess()?;
            let sub_order = match strategy {
                Strategy::BruteforceOrder => sub.bruteforce_optimal_order()?,
                Strategy::BruteforceSatisfiable => sub.bruteforce_satisfiable_edges()?,
                Strategy::Greedy => sub.greedy_topological_order()?,
                Strategy::Auto => sub.auto_topological_order()?,
            };
            order.extend(sub_order);
        }
        Ok(order)
    }

    /// Number of adjacent satisfiable pairs in `order`.
    pub fn satisfied_in_order(&self, order: &[usize]) -> usize {
        order
            .windows(2)
            .filter(|w| self.satisfiable.contains(&(w[0], w[1])))
            .count()
    }

    /// Number of `u -> w` paths for every `w` reachable from `u`,
    /// memoized per source node.
    fn paths(
        &self,
        u: usize,
        cache: &mut IndexMap<usize, IndexMap<usize, u64>>,
    ) -> IndexMap<usize, u64> {
        if let Some(known) = cache.get(&u) {
            return known.clone();
        }
        let mut counts: IndexMap<usize, u64> = IndexMap::default();
        for i in 0..self.graph.edge_list(u).len() {
            let v = self.graph.edge_list(u)[i];
            let entry = counts.entry(v).or_insert(0);
            *entry = entry.saturating_add(1);
            for (w, c) in self.paths(v, cache) {
                let entry = counts.entry(w).or_insert(0);
                *entry = entry.saturating_add(c);
            }
        }
        cache.insert(u, counts.clone());
        counts
    }

    /// Assert acyclicity and drop redundant edges.
    ///
    /// An edge `(u, v)` is redundant if another `u -> v` path of length
    /// at least 2 exists; its endpoints can then never be adjacent, so
    /// it can never be satisfied.
    fn preprocess(&mut self) -> Result<()> {
        self.graph.validate_acyclic()?;

        let mut cache = IndexMap::default();
        let nodes: Vec<usize> = self.graph.nodes().collect();
        for u in nodes {
            let counts = self.paths(u, &mut cache);
            let redundant: Vec<usize> = self
                .graph
                .edge_list(u)
                .iter()
                .copied()
                .filter(|v| counts.get(v).copied().unwrap_or(0) > 1)
                .collect();
            for v in redundant {
                self.remove_edge(u, v);
            }
        }
        Ok(())
    }

    /// Subgraph induced by `nodes`, keeping satisfiable marks.
    fn subgraph(&self, nodes: &IndexSet<usize>) -> SatisfiableGraph {
        let mut sub = SatisfiableGraph::new();
        for &u in nodes {
            sub.add_node(u);
            for &v in self.graph.edge_list(u) {
                if nodes.contains(&v) {
                    sub.add_edge(u, v, self.satisfiable.contains(&(u, v)));
                }
            }
        }
        sub
    }

    /// Split into independent subgraphs along cuts free of satisfiable
    /// edges: the SCCs of the graph closed under reversed satisfiable
    /// edges are the largest subgraphs inside which a satisfiable edge
    /// could possibly be contracted.
    fn split_graph(&self) -> Vec<SatisfiableGraph> {
        let mut closure = self.graph.clone();
        for &(u, v) in &self.satisfiable {
            closure.add_edge(v, u);
        }
        closure
            .strongly_connected_components()
            .into_iter()
            .map(|component| {
                let nodes: IndexSet<usize> = component.into_iter().collect();
                self.subgraph(&nodes)
            })
            .collect()
    }

    /// Any solution must satisfy at least this many edges: a preprocessed
    /// satisfiable edge can always be satisfied on its own.
    fn minimum_satisfiable_edges(&self) -> usize {
        usize::from(!self.satisfiable.is_empty())
    }

    fn auto_topological_order(&mut self) -> Result<Vec<usize>> {
        if self.satisfiable.len() <= MAX_BRUTEFORCE_SATISFIABLE {
            return self.bruteforce_satisfiable_edges();
        }
        if self.graph.len() <= MAX_BRUTEFORCE_DEPTH {
            return self.bruteforce_optimal_order();
        }
        self.greedy_topological_order()
    }

    /// Exact search over node permutations, `O*(n!)`: repeatedly pick
    /// any indegree-0 node, scoring adjacent satisfiable pairs.
    fn bruteforce_optimal_order(&self) -> Result<Vec<usize>> {
        let mut indegrees: IndexMap<usize, usize> = self.graph.nodes().map(|u| (u, 0)).collect();
        for u in self.graph.nodes() {
            for &v in self.graph.edge_list(u) {
                indegrees[&v] += 1;
            }
        }
        let mut roots: IndexSet<usize> = self
            .graph
            .nodes()
            .filter(|u| indegrees[u] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.len());
        let result = self.permute(&mut indegrees, &mut roots, &mut order);
        Ok(result.order)
    }

    fn permute(
        &self,
        indegrees: &mut IndexMap<usize, usize>,
        roots: &mut IndexSet<usize>,
        order: &mut Vec<usize>,
    ) -> OrderResult {
        if order.len() == self.graph.len() {
            return OrderResult {
                satisfied: 0,
                order: order.clone(),
            };
        }

        let total = self.satisfiable.len();
        let mut best: Option<OrderResult> = None;
        let candidates: Vec<usize> = roots.iter().copied().collect();
        for u in candidates {
            let satisfied_edge = order
                .last()
                .is_some_and(|&last| self.satisfiable.contains(&(last, u)));

            roots.shift_remove(&u);
            let mut new_roots = Vec::new();
            for &v in self.graph.edge_list(u) {
                let indegree = &mut indegrees[&v];
                *indegree -= 1;
                if *indegree == 0 {
                    roots.insert(v);
                    new_roots.push(v);
                }
            }
            order.push(u);

            let mut result = self.permute(indegrees, roots, order);
            result.satisfied += usize::from(satisfied_edge);
            let better = best
                .as_ref()
                .is_none_or(|b| result.satisfied > b.satisfied);
            if better {
                best = Some(result);
            }

            order.pop();
            for v in new_roots {
                roots.shift_remove(&v);
            }
            for &v in self.graph.edge_list(u) {
                indegrees[&v] += 1;
            }
            roots.insert(u);

            if best.as_ref().is_some_and(|b| b.satisfied == total) {
                break;
            }
        }

        best.expect("DAG with unordered nodes must have a root")
    }

    /// Exact search over satisfiable-edge subsets, `O*(2^|S|)`: contract
    /// each chosen edge, reject subsets giving a node more than one
    /// satisfied edge in either direction or making the contracted graph
    /// cyclic, then expand the best contraction back into a full order.
    fn bruteforce_satisfiable_edges(&self) -> Result<Vec<usize>> {
        let n = self.graph.len();
        let m = self.satisfiable.len();
        debug_assert!(m < u64::BITS as usize, "too many satisfiable edges");

        let node_index: IndexMap<usize, usize> =
            self.graph.nodes().enumerate().map(|(i, u)| (u, i)).collect();
        let rev_index: Vec<usize> = self.graph.nodes().collect();
        let sat_edges: Vec<(usize, usize)> = self.satisfiable.iter().copied().collect();

        struct Best {
            satisfied: usize,
            chains: IndexMap<usize, Graph<usize>>,
            contracted: Graph<usize>,
        }

        let minimum = self.minimum_satisfiable_edges();
        let mut best: Option<Best> = None;

        for mask in 0u64..(1u64 << m) {
            let mut contraction = QuickUnionUf::<UnionBySize>::new(n);
            let mut satisfied_out: IndexSet<usize> = IndexSet::default();
            let mut satisfied_in: IndexSet<usize> = IndexSet::default();

            let mut feasible = true;
            let mut satisfied = 0;
            for (j, &(u, v)) in sat_edges.iter().enumerate() {
                if mask & (1 << j) == 0 {
                    continue;
                }
                let k = node_index[&u];
                let l = node_index[&v];
                contraction.union(k, l);
                if !satisfied_out.insert(k) || !satisfied_in.insert(l) {
                    feasible = false;
                    break;
                }
                satisfied += 1;
            }
            if !feasible || satisfied < minimum {
                continue;
            }
            if best.as_ref().is_some_and(|b| satisfied <= b.satisfied) {
                continue;
            }

            // The chosen edges form chains inside each contracted
            // component; remember them for expansion.
            let mut chains: IndexMap<usize, Graph<usize>> = IndexMap::default();
            for (j, &(u, v)) in sat_edges.iter().enumerate() {
                if mask & (1 << j) == 0 {
                    continue;
                }
                let root = contraction.find(node_index[&u]);
                chains
                    .entry(root)
                    .or_default()
                    .add_edge(node_index[&u], node_index[&v]);
            }

            let mut contracted = Graph::new();
            for j in 0..n {
                contracted.add_node(contraction.find(j));
            }
            for u in self.graph.nodes() {
                let j = contraction.find(node_index[&u]);
                for &v in self.graph.edge_list(u) {
                    let k = contraction.find(node_index[&v]);
                    if j != k {
                        contracted.add_edge(j, k);
                    }
                }
            }
            if contracted.validate_acyclic().is_err() {
                continue;
            }

            let done = satisfied == m;
            best = Some(Best {
                satisfied,
                chains,
                contracted,
            });
            if done {
                break;
            }
        }

        // The empty subset is always feasible on a DAG.
        let best = best.expect("no feasible satisfiable subset");

        let mut index_order = best.contracted.topological_order()?;
        for (root, chain) in &best.chains {
            let path = chain.topological_order()?;
            let pos = index_order
                .iter()
                .position(|x| x == root)
                .expect("contracted root missing from order");
            index_order[pos] = *path.last().expect("empty contraction chain");
            index_order.splice(pos..pos, path[..path.len() - 1].iter().copied());
        }

        Ok(index_order.into_iter().map(|i| rev_index[i]).collect())
    }

    /// Heuristic: stable-sort adjacency lists so satisfiable edges come
    /// last, then take the root-first topological order. DFS then
    /// finishes non-satisfiable successors first, leaving satisfiable
    /// endpoints adjacent more often.
    fn greedy_topological_order(&mut self) -> Result<Vec<usize>> {
        let nodes: Vec<usize> = self.graph.nodes().collect();
        for u in nodes {
            let satisfiable = &self.satisfiable;
            self.graph.sort_edge_list_by(u, |a, b| {
                satisfiable
                    .contains(&(u, *a))
                    .cmp(&satisfiable.contains(&(u, *b)))
            });
        }
        self.graph.rootfirst_topological_order()
    }
}
