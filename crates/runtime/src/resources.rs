//! Resource assignment
//!
//! Distributes a per-phase memory or file budget across nodes and
//! persistent data structures. Each node is assigned
//! `clamp(min, max, factor * fraction)`; the factor is found by an
//! exponential search followed by bisection over the monotone assigned
//! sum. Memory runs in two passes so that data structures spanning
//! several phases settle on the smallest factor of any phase they live
//! through.

use std::fmt::Write as _;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::node::{DatastructureSlot, NodeMap};
use crate::types::{NodeId, ResourceKind, UNBOUNDED};

const FRACTION_EPSILON: f64 = 1e-9;
const FACTOR_EPSILON: f64 = 1e-6;

fn clamp(lo: u64, hi: u64, v: f64) -> u64 {
    if v < lo as f64 {
        lo
    } else if v > hi as f64 {
        hi
    } else {
        v as u64
    }
}

/// Snapshot of one phase's per-node requirements for one resource kind.
pub struct ResourceRuntime {
    kind: ResourceKind,
    ids: Vec<NodeId>,
    names: Vec<String>,
    minimums: Vec<u64>,
    maximums: Vec<u64>,
    fractions: Vec<f64>,
}

impl ResourceRuntime {
    pub fn gather(map: &NodeMap, phase: &[NodeId], kind: ResourceKind) -> Self {
        let mut runtime = Self {
            kind,
            ids: Vec::with_capacity(phase.len()),
            names: Vec::with_capacity(phase.len()),
            minimums: Vec::with_capacity(phase.len()),
            maximums: Vec::with_capacity(phase.len()),
            fractions: Vec::with_capacity(phase.len()),
        };
        for &id in phase {
            let node = map.node(id);
            runtime.ids.push(id);
            runtime.names.push(node.name());
            runtime.minimums.push(node.minimum_resource_usage(kind));
            runtime.maximums.push(node.maximum_resource_usage(kind));
            runtime.fractions.push(node.resource_fraction(kind));
        }
        runtime
    }

    pub fn sum_minimum_usage(&self) -> u64 {
        self.minimums.iter().sum()
    }

    pub fn sum_fraction(&self) -> f64 {
        self.fractions.iter().sum()
    }

    fn assigned_usage(&self, i: usize, factor: f64) -> u64 {
        clamp(
            self.minimums[i],
            self.maximums[i],
            factor * self.fractions[i],
        )
    }

    pub fn sum_assigned_usage(&self, factor: f64) -> u64 {
        (0..self.ids.len())
            .map(|i| self.assigned_usage(i, factor))
            .sum()
    }

    /// Write the per-node assignments into the nodes.
    pub fn assign_usage(&self, map: &mut NodeMap, factor: f64) {
        for &id in &self.ids {
            map.node_mut(id).set_resource_being_assigned(Some(self.kind));
        }
        for (i, &id) in self.ids.iter().enumerate() {
            map.node_mut(id)
                .set_available_of_resource(self.kind, self.assigned_usage(i, factor));
        }
        for &id in &self.ids {
            map.node_mut(id).set_resource_being_assigned(None);
        }
    }

    fn log_usage(&self, factor: f64) {
        let mut table = String::new();
        let _ = writeln!(
            table,
            "{:>12} {:>12} {:>12} {:>12}  name",
            "minimum", "maximum", "fraction", "assigned"
        );
        for i in 0..self.ids.len() {
            let maximum = if self.maximums[i] == UNBOUNDED {
                "inf".to_string()
            } else {
                self.maximums[i].to_string()
            };
            let _ = writeln!(
                table,
                "{:>12} {:>12} {:>12.2} {:>12}  {}",
                self.minimums[i],
                maximum,
                self.fractions[i],
                self.assigned_usage(i, factor),
                self.names[i]
            );
        }
        debug!(kind = %self.kind, "assigned resource usage\n{table}");
    }
}

#[derive(Debug)]
struct DatastructureInfo {
    minimum: u64,
    maximum: u64,
    priority: f64,
    left_most_phase: usize,
    right_most_phase: usize,
    factor: f64,
}

impl DatastructureInfo {
    fn lives_in(&self, phase: usize) -> bool {
        self.left_most_phase <= phase && phase <= self.right_most_phase
    }
}

/// Cross-phase accounting for persistent data structures.
///
/// A data structure consumes memory in every phase between its left-most
/// and right-most referencing phase, so its factor is the minimum over
/// the factors of all those phases.
pub struct DatastructureRuntime {
    datastructures: IndexMap<String, DatastructureInfo>,
}

impl DatastructureRuntime {
    /// Aggregate declarations across all phases: `min` is the largest
    /// declared minimum, `max` the smallest declared maximum, `priority`
    /// the smallest declared priority.
    pub fn new(map: &NodeMap, phases: &[Vec<NodeId>]) -> Result<Self> {
        let mut datastructures: IndexMap<String, DatastructureInfo> = IndexMap::default();
        for (phase, nodes) in phases.iter().enumerate() {
            for &id in nodes {
                for (name, spec) in map.node(id).datastructures() {
                    match datastructures.get_mut(&name) {
                        None => {
                            datastructures.insert(
                                name,
                                DatastructureInfo {
                                    minimum: spec.minimum,
                                    maximum: spec.maximum,
                                    priority: spec.priority,
                                    left_most_phase: phase,
                                    right_most_phase: phase,
                                    factor: f64::INFINITY,
                                },
                            );
                        }
                        Some(info) => {
                            info.minimum = info.minimum.max(spec.minimum);
                            info.maximum = info.maximum.min(spec.maximum);
                            info.priority = info.priority.min(spec.priority);
                            info.right_most_phase = phase;
                        }
                    }
                }
            }
        }
        for (name, info) in &datastructures {
            if info.minimum > info.maximum {
                return Err(Error::MalformedDatastructure { name: name.clone() });
            }
        }
        Ok(Self { datastructures })
    }

    fn live(&self, phase: usize) -> impl Iterator<Item = &DatastructureInfo> {
        self.datastructures
            .values()
            .filter(move |info| info.lives_in(phase))
    }

    pub fn sum_minimum_memory(&self, phase: usize) -> u64 {
        self.live(phase).map(|info| info.minimum).sum()
    }

    pub fn sum_fraction(&self, phase: usize) -> f64 {
        self.live(phase).map(|info| info.priority).sum()
    }

    /// Assigned memory in `phase` if every live structure used `factor`.
    pub fn sum_assigned_memory_at(&self, factor: f64, phase: usize) -> u64 {
        self.live(phase)
            .map(|info| clamp(info.minimum, info.maximum, info.priority * factor))
            .sum()
    }

    /// Assigned memory in `phase` under the locked factors from
    /// [`DatastructureRuntime::minimize_factor`].
    pub fn sum_assigned_memory(&self, phase: usize) -> u64 {
        self.live(phase)
            .map(|info| clamp(info.minimum, info.maximum, info.priority * info.factor))
            .sum()
    }

    /// Cap the factor of every structure live in `phase` at `factor`.
    pub fn minimize_factor(&mut self, factor: f64, phase: usize) {
        for info in self.datastructures.values_mut() {
            if info.lives_in(phase) {
                info.factor = info.factor.min(factor);
            }
        }
    }

    /// Commit the final assignments into the node map's slot store.
    pub fn assign_memory(&self, map: &mut NodeMap) {
        for (name, info) in &self.datastructures {
            let assigned = clamp(info.minimum, info.maximum, info.factor * info.priority);
            map.datastructures_mut().insert(
                name.clone(),
                DatastructureSlot {
                    assigned,
                    payload: None,
                },
            );
        }
    }

    /// Drop the payload of every structure whose right-most phase is
    /// `phase`; the assigned byte count stays on record.
    pub fn free_datastructures(&self, map: &mut NodeMap, phase: usize) {
        for (name, info) in &self.datastructures {
            if info.right_most_phase != phase {
                continue;
            }
            if let Some(slot) = map.datastructures_mut().get_mut(name) {
                slot.payload = None;
            }
        }
    }
}

/// Largest feasible factor for one phase's file budget.
pub fn files_factor(files: u64, frt: &ResourceRuntime) -> f64 {
    let minimum = frt.sum_minimum_usage();
    if minimum > files {
        warn!(
            required = minimum,
            available = files,
            "not enough files for pipelining phase"
        );
        return 0.0;
    }

    let fraction_sum = frt.sum_fraction();
    if fraction_sum < FRACTION_EPSILON {
        return 0.0;
    }

    search_factor(files, fraction_sum, |factor| frt.sum_assigned_usage(factor))
}

/// Largest feasible factor for one phase's memory budget, counting the
/// data structures live in the phase either at the candidate factor
/// (first pass) or at their locked factors (second pass).
pub fn memory_factor(
    memory: u64,
    phase: usize,
    mrt: &ResourceRuntime,
    drt: &DatastructureRuntime,
    datastructures_locked: bool,
) -> f64 {
    let minimum = mrt.sum_minimum_usage() + drt.sum_minimum_memory(phase);
    if minimum > memory {
        warn!(
            required = minimum,
            available = memory,
            "not enough memory for pipelining phase"
        );
        return 0.0;
    }

    let fraction_sum = mrt.sum_fraction() + drt.sum_fraction(phase);
    if fraction_sum < FRACTION_EPSILON {
        return 0.0;
    }

    search_factor(memory, fraction_sum, |factor| {
        let datastructure_memory = if datastructures_locked {
            drt.sum_assigned_memory(phase)
        } else {
            drt.sum_assigned_memory_at(factor, phase)
        };
        mrt.sum_assigned_usage(factor) + datastructure_memory
    })
}

/// Find the largest `c` with `assigned(budget * c / fraction_sum) <=
/// budget` and return the corresponding factor. `assigned` must be
/// monotone non-decreasing, which holds because every clamped term is.
fn search_factor(budget: u64, fraction_sum: f64, assigned: impl Fn(f64) -> u64) -> f64 {
    let mut c_lo = 0.0_f64;
    let mut c_hi = 1.0_f64;

    // Exponential search: double until the budget is reached or the sum
    // stops growing (every term clamped at its maximum).
    let mut previous = 0;
    loop {
        let used = assigned(budget as f64 * c_hi / fraction_sum);
        if used < budget && used != previous {
            previous = used;
            c_hi *= 2.0;
        } else {
            break;
        }
    }

    if assigned(budget as f64 * c_hi / fraction_sum) <= budget {
        return budget as f64 * c_hi / fraction_sum;
    }

    while c_hi - c_lo > FACTOR_EPSILON {
        let c = c_lo + (c_hi - c_lo) / 2.0;
        if assigned(budget as f64 * c / fraction_sum) > budget {
            c_hi = c;
        } else {
            c_lo = c;
        }
    }

    budget as f64 * c_lo / fraction_sum
}

/// Assign the file budget to every phase.
pub fn assign_files(map: &mut NodeMap, phases: &[Vec<NodeId>], files: u64) {
    for phase in phases {
        let frt = ResourceRuntime::gather(map, phase, ResourceKind::Files);
        let factor = files_factor(files, &frt);
        frt.log_usage(factor);
        frt.assign_usage(map, factor);
    }
}

/// Re-run file assignment for one phase.
pub fn reassign_files(map: &mut NodeMap, phases: &[Vec<NodeId>], phase: usize, files: u64) {
    let frt = ResourceRuntime::gather(map, &phases[phase], ResourceKind::Files);
    let factor = files_factor(files, &frt);
    frt.log_usage(factor);
    frt.assign_usage(map, factor);
}

/// Assign the memory budget to every phase.
///
/// First pass lets data structures grow with each phase's factor and
/// records the minimum; second pass locks them there and assigns node
/// memory, then commits the data-structure assignments.
pub fn assign_memory(
    map: &mut NodeMap,
    phases: &[Vec<NodeId>],
    memory: u64,
    drt: &mut DatastructureRuntime,
) {
    for (phase, nodes) in phases.iter().enumerate() {
        let mrt = ResourceRuntime::gather(map, nodes, ResourceKind::Memory);
        let factor = memory_factor(memory, phase, &mrt, drt, false);
        drt.minimize_factor(factor, phase);
    }

    for (phase, nodes) in phases.iter().enumerate() {
        let mrt = ResourceRuntime::gather(map, nodes, ResourceKind::Memory);
        let factor = memory_factor(memory, phase, &mrt, drt, true);
        mrt.log_usage(factor);
        mrt.assign_usage(map, factor);
    }

    drt.assign_memory(map);
}

/// Re-run memory assignment for one phase with locked data structures.
pub fn reassign_memory(
    map: &mut NodeMap,
    phases: &[Vec<NodeId>],
    phase: usize,
    memory: u64,
    drt: &DatastructureRuntime,
) {
    let mrt = ResourceRuntime::gather(map, &phases[phase], ResourceKind::Memory);
    let factor = memory_factor(memory, phase, &mrt, drt, true);
    mrt.log_usage(factor);
    mrt.assign_usage(map, factor);
}
