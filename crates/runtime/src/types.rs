//! Core runtime types
//!
//! Identifiers, node relations, lifecycle states and resource
//! declarations shared across the pipeline runtime.

use std::fmt;

/// Resource maximum meaning "no upper bound".
pub const UNBOUNDED: u64 = u64::MAX;

/// Unique identifier for a pipeline node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Relation between two nodes, stored as `(from, to, relation)`.
///
/// `Pushes` and `Pulls` express item flow: `from` pushes items to `to`,
/// or pulls items from `to`. The three dependency variants express
/// ordering without data flow: `from` depends on `to`, so `to` must run
/// in an earlier phase. Only `MemoryShareDepends` can yield a benefit
/// when the two phases end up adjacent in the phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Pushes,
    Pulls,
    Depends,
    NoForwardDepends,
    MemoryShareDepends,
}

impl Relation {
    /// Whether this relation orders phases instead of joining them.
    pub fn is_dependency(self) -> bool {
        matches!(
            self,
            Relation::Depends | Relation::NoForwardDepends | Relation::MemoryShareDepends
        )
    }
}

/// Resource kinds assigned per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Files,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Files => write!(f, "files"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Lifecycle states in execution order.
///
/// The runtime sets these around every lifecycle call; node
/// implementations may use them to reject out-of-order API use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Fresh,
    InPrepare,
    AfterPrepare,
    InPropagate,
    AfterPropagate,
    InBegin,
    AfterBegin,
    InGo,
    InEnd,
    AfterEnd,
}

/// Per-node, per-resource requirements.
///
/// `fraction` is a relative priority weight; the assigned amount is
/// `clamp(minimum, maximum, factor * fraction)` for the phase's factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub minimum: u64,
    pub maximum: u64,
    pub fraction: f64,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            minimum: 0,
            maximum: UNBOUNDED,
            fraction: 0.0,
        }
    }
}

/// Declaration of one persistent data structure by one node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatastructureSpec {
    pub minimum: u64,
    pub maximum: u64,
    pub priority: f64,
}

impl Default for DatastructureSpec {
    fn default() -> Self {
        Self {
            minimum: 0,
            maximum: UNBOUNDED,
            priority: 1.0,
        }
    }
}
