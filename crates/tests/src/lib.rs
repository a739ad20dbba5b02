//! Integration test harness for the sluice pipeline runtime.
//!
//! Provides scripted nodes and a small builder around [`NodeMap`] so
//! end-to-end scenarios can assert lifecycle traces, resource
//! assignments and progress notifications.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use sluice_runtime::error::NodeError;
use sluice_runtime::executor::Runtime;
use sluice_runtime::node::{NodeMap, PipeNode};
use sluice_runtime::progress::{ProgressHandle, ProgressIndicator, SourceLocation};
use sluice_runtime::{
    DatastructureSpec, NodeId, NodeState, Relation, Result, ResourceKind, ResourceUsage,
};

/// Shared lifecycle trace, one entry per call like `"begin sort"`.
pub type Trace = Rc<RefCell<Vec<String>>>;

/// Shared record of the latest resource assignment per node and kind.
pub type Assignments = Rc<RefCell<IndexMap<(NodeId, ResourceKind), u64>>>;

/// Progress sink counting everything it receives.
#[derive(Default)]
pub struct CountingProgress {
    pub inits: Vec<u64>,
    pub steps: u64,
    pub dones: usize,
}

impl ProgressIndicator for CountingProgress {
    fn init(&mut self, steps: u64) {
        self.inits.push(steps);
    }

    fn step(&mut self, steps: u64) {
        self.steps += steps;
    }

    fn done(&mut self) {
        self.dones += 1;
    }
}

/// Declarative description of a scripted node.
pub struct NodeSpec {
    name: String,
    phase_name: String,
    phase_name_priority: i32,
    memory: ResourceUsage,
    files: ResourceUsage,
    datastructures: IndexMap<String, DatastructureSpec>,
    steps: u64,
    can_evacuate: bool,
    fail_in: Option<&'static str>,
}

impl NodeSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase_name: String::new(),
            phase_name_priority: 0,
            memory: ResourceUsage::default(),
            files: ResourceUsage::default(),
            datastructures: IndexMap::default(),
            steps: 0,
            can_evacuate: false,
            fail_in: None,
        }
    }

    pub fn memory(mut self, minimum: u64, maximum: u64, fraction: f64) -> Self {
        self.memory = ResourceUsage {
            minimum,
            maximum,
            fraction,
        };
        self
    }

    pub fn files(mut self, minimum: u64, maximum: u64, fraction: f64) -> Self {
        self.files = ResourceUsage {
            minimum,
            maximum,
            fraction,
        };
        self
    }

    pub fn steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn evacuatable(mut self) -> Self {
        self.can_evacuate = true;
        self
    }

    pub fn phase_name(mut self, name: &str, priority: i32) -> Self {
        self.phase_name = name.to_string();
        self.phase_name_priority = priority;
        self
    }

    pub fn datastructure(mut self, name: &str, spec: DatastructureSpec) -> Self {
        self.datastructures.insert(name.to_string(), spec);
        self
    }

    pub fn failing_in(mut self, stage: &'static str) -> Self {
        self.fail_in = Some(stage);
        self
    }
}

/// Scripted node: records lifecycle calls into the shared trace, resource
/// assignments into the shared record, and reports its steps through the
/// installed progress indicator when driven.
struct ScriptedNode {
    id: NodeId,
    spec: NodeSpec,
    state: NodeState,
    progress: Option<ProgressHandle>,
    trace: Trace,
    assignments: Assignments,
}

impl ScriptedNode {
    fn record(&self, event: &str) -> std::result::Result<(), NodeError> {
        self.trace
            .borrow_mut()
            .push(format!("{event} {}", self.spec.name));
        if self.spec.fail_in == Some(event) {
            return Err(format!("scripted failure in {event}").into());
        }
        Ok(())
    }

    /// Reject lifecycle calls made outside their state bracket.
    fn ensure_state(&self, expected: NodeState) -> std::result::Result<(), NodeError> {
        if self.state != expected {
            return Err(format!(
                "{} called on {} in state {:?}",
                match expected {
                    NodeState::InPrepare => "prepare",
                    NodeState::InPropagate => "propagate",
                    NodeState::InBegin => "begin",
                    NodeState::InGo => "go",
                    NodeState::InEnd => "end",
                    _ => "lifecycle",
                },
                self.spec.name,
                self.state
            )
            .into());
        }
        Ok(())
    }
}

impl PipeNode for ScriptedNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> String {
        self.spec.name.clone()
    }

    fn phase_name(&self) -> String {
        self.spec.phase_name.clone()
    }

    fn phase_name_priority(&self) -> i32 {
        self.spec.phase_name_priority
    }

    fn minimum_resource_usage(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Files => self.spec.files.minimum,
            ResourceKind::Memory => self.spec.memory.minimum,
        }
    }

    fn maximum_resource_usage(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Files => self.spec.files.maximum,
            ResourceKind::Memory => self.spec.memory.maximum,
        }
    }

    fn resource_fraction(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Files => self.spec.files.fraction,
            ResourceKind::Memory => self.spec.memory.fraction,
        }
    }

    fn datastructures(&self) -> IndexMap<String, DatastructureSpec> {
        self.spec.datastructures.clone()
    }

    fn steps(&self) -> u64 {
        self.spec.steps
    }

    fn can_evacuate(&self) -> bool {
        self.spec.can_evacuate
    }

    fn evacuate(&mut self) {
        let _ = self.record("evacuate");
    }

    fn prepare(&mut self) -> std::result::Result<(), NodeError> {
        self.ensure_state(NodeState::InPrepare)?;
        self.record("prepare")
    }

    fn propagate(&mut self) -> std::result::Result<(), NodeError> {
        self.ensure_state(NodeState::InPropagate)?;
        self.record("propagate")
    }

    fn begin(&mut self) -> std::result::Result<(), NodeError> {
        self.ensure_state(NodeState::InBegin)?;
        self.record("begin")
    }

    fn go(&mut self) -> std::result::Result<(), NodeError> {
        self.ensure_state(NodeState::InGo)?;
        self.record("go")?;
        if let Some(progress) = &self.progress {
            progress.borrow_mut().step(self.spec.steps);
        }
        Ok(())
    }

    fn end(&mut self) -> std::result::Result<(), NodeError> {
        self.ensure_state(NodeState::InEnd)?;
        self.record("end")
    }

    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    fn set_progress_indicator(&mut self, pi: Option<ProgressHandle>) {
        self.progress = pi;
    }

    fn set_available_of_resource(&mut self, kind: ResourceKind, amount: u64) {
        self.assignments.borrow_mut().insert((self.id, kind), amount);
    }
}

/// Builder and driver for one pipeline scenario.
pub struct TestHarness {
    map: NodeMap,
    trace: Trace,
    assignments: Assignments,
    progress: Rc<RefCell<CountingProgress>>,
    next_id: u64,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            map: NodeMap::new(),
            trace: Rc::new(RefCell::new(Vec::new())),
            assignments: Rc::new(RefCell::new(IndexMap::default())),
            progress: Rc::new(RefCell::new(CountingProgress::default())),
            next_id: 0,
        }
    }

    /// Add a scripted node and return its id.
    pub fn add(&mut self, spec: NodeSpec) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.map.insert(Box::new(ScriptedNode {
            id,
            spec,
            state: NodeState::Fresh,
            progress: None,
            trace: self.trace.clone(),
            assignments: self.assignments.clone(),
        }));
        id
    }

    /// Shorthand for a plain node with nothing but a name.
    pub fn add_named(&mut self, name: &str) -> NodeId {
        self.add(NodeSpec::new(name))
    }

    pub fn relate(&mut self, from: NodeId, to: NodeId, relation: Relation) {
        self.map.add_relation(from, to, relation);
    }

    /// Run the pipeline to completion with a real progress sink.
    pub fn run(&mut self, items: u64, files: u64, memory: u64) -> Result<()> {
        let sink: ProgressHandle = self.progress.clone();
        let mut runtime = Runtime::new(&mut self.map);
        runtime.go(
            items,
            sink,
            files,
            memory,
            Some(SourceLocation {
                file: file!(),
                function: "TestHarness::run",
            }),
        )
    }

    /// Borrow a runtime over the harness's node map for incremental
    /// execution.
    pub fn runtime(&mut self) -> Runtime<'_> {
        Runtime::new(&mut self.map)
    }

    pub fn progress_sink(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub fn map(&self) -> &NodeMap {
        &self.map
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.borrow().clone()
    }

    pub fn assigned(&self, id: NodeId, kind: ResourceKind) -> u64 {
        self.assignments.borrow()[&(id, kind)]
    }

    pub fn total_assigned(&self, kind: ResourceKind) -> u64 {
        self.assignments
            .borrow()
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, &amount)| amount)
            .sum()
    }

    pub fn progress_inits(&self) -> Vec<u64> {
        self.progress.borrow().inits.clone()
    }

    pub fn progress_steps(&self) -> u64 {
        self.progress.borrow().steps
    }

    pub fn progress_dones(&self) -> usize {
        self.progress.borrow().dones
    }
}
