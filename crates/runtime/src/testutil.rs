//! Scripted node fixtures for unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::NodeError;
use crate::node::PipeNode;
use crate::types::{DatastructureSpec, NodeId, NodeState, ResourceKind, ResourceUsage};

pub(crate) type SharedTrace = Rc<RefCell<Vec<String>>>;
pub(crate) type SharedAssignments = Rc<RefCell<IndexMap<(NodeId, ResourceKind), u64>>>;

/// Configurable node double recording lifecycle calls and resource
/// assignments into shared logs.
pub(crate) struct TestNode {
    id: NodeId,
    name: String,
    phase_name: String,
    name_priority: i32,
    phase_name_priority: i32,
    memory: ResourceUsage,
    files: ResourceUsage,
    datastructures: IndexMap<String, DatastructureSpec>,
    can_evacuate: bool,
    fail_in: Option<&'static str>,
    trace: Option<SharedTrace>,
    assignments: Option<SharedAssignments>,
}

impl TestNode {
    pub fn named(id: u64, name: &str) -> Self {
        Self {
            id: NodeId(id),
            name: name.to_string(),
            phase_name: String::new(),
            name_priority: 0,
            phase_name_priority: 0,
            memory: ResourceUsage::default(),
            files: ResourceUsage::default(),
            datastructures: IndexMap::default(),
            can_evacuate: false,
            fail_in: None,
            trace: None,
            assignments: None,
        }
    }

    pub fn evacuatable(mut self) -> Self {
        self.can_evacuate = true;
        self
    }

    pub fn with_priorities(mut self, name_priority: i32, phase_name_priority: i32) -> Self {
        self.name_priority = name_priority;
        self.phase_name_priority = phase_name_priority;
        self
    }

    pub fn with_phase_name(mut self, phase_name: &str, priority: i32) -> Self {
        self.phase_name = phase_name.to_string();
        self.phase_name_priority = priority;
        self
    }

    pub fn with_memory(mut self, minimum: u64, maximum: u64, fraction: f64) -> Self {
        self.memory = ResourceUsage {
            minimum,
            maximum,
            fraction,
        };
        self
    }

    pub fn with_files(mut self, minimum: u64, maximum: u64, fraction: f64) -> Self {
        self.files = ResourceUsage {
            minimum,
            maximum,
            fraction,
        };
        self
    }

    pub fn with_datastructure(mut self, name: &str, spec: DatastructureSpec) -> Self {
        self.datastructures.insert(name.to_string(), spec);
        self
    }

    pub fn with_trace(mut self, trace: SharedTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_assignments(mut self, assignments: SharedAssignments) -> Self {
        self.assignments = Some(assignments);
        self
    }

    pub fn failing_in(mut self, stage: &'static str) -> Self {
        self.fail_in = Some(stage);
        self
    }

    fn record(&self, event: &str) -> Result<(), NodeError> {
        if let Some(trace) = &self.trace {
            trace.borrow_mut().push(format!("{event} {}", self.name));
        }
        if self.fail_in == Some(event) {
            return Err(format!("scripted failure in {event}").into());
        }
        Ok(())
    }
}

impl PipeNode for TestNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn name_priority(&self) -> i32 {
        self.name_priority
    }

    fn phase_name(&self) -> String {
        self.phase_name.clone()
    }

    fn phase_name_priority(&self) -> i32 {
        self.phase_name_priority
    }

    fn minimum_resource_usage(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Files => self.files.minimum,
            ResourceKind::Memory => self.memory.minimum,
        }
    }

    fn maximum_resource_usage(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Files => self.files.maximum,
            ResourceKind::Memory => self.memory.maximum,
        }
    }

    fn resource_fraction(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Files => self.files.fraction,
            ResourceKind::Memory => self.memory.fraction,
        }
    }

    fn datastructures(&self) -> IndexMap<String, DatastructureSpec> {
        self.datastructures.clone()
    }

    fn can_evacuate(&self) -> bool {
        self.can_evacuate
    }

    fn evacuate(&mut self) {
        let _ = self.record("evacuate");
    }

    fn prepare(&mut self) -> Result<(), NodeError> {
        self.record("prepare")
    }

    fn propagate(&mut self) -> Result<(), NodeError> {
        self.record("propagate")
    }

    fn begin(&mut self) -> Result<(), NodeError> {
        self.record("begin")
    }

    fn go(&mut self) -> Result<(), NodeError> {
        self.record("go")
    }

    fn end(&mut self) -> Result<(), NodeError> {
        self.record("end")
    }

    fn set_state(&mut self, _state: NodeState) {}

    fn set_available_of_resource(&mut self, kind: ResourceKind, amount: u64) {
        if let Some(assignments) = &self.assignments {
            assignments.borrow_mut().insert((self.id, kind), amount);
        }
    }
}
