//! Progress scaffolding
//!
//! Scoped init/done pairing for nested progress indicators. Completion
//! is explicit: dropping a holder without calling `complete` emits no
//! `done`, which is exactly the abort path — a failed phase must not
//! report completion.

use std::cell::RefCell;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::rc::Rc;

/// Sink for progress notifications.
pub trait ProgressIndicator {
    fn init(&mut self, steps: u64);
    fn step(&mut self, steps: u64);
    fn done(&mut self);
}

/// Shared handle to a progress indicator.
pub type ProgressHandle = Rc<RefCell<dyn ProgressIndicator>>;

/// Call site driving a run, used to label progress output. When absent,
/// null indicators are substituted and nothing is forwarded.
#[derive(Debug, Clone, Copy)]
pub struct SourceLocation {
    pub file: &'static str,
    pub function: &'static str,
}

/// Order-sensitive combine of a name into a running identifier hash.
pub(crate) fn combine_name_hash(seed: u64, name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let h = hasher.finish();
    seed ^ h
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Parent indicator spreading the caller's sink across a run's phases.
struct FractionalProgress {
    sink: ProgressHandle,
}

impl ProgressIndicator for FractionalProgress {
    fn init(&mut self, steps: u64) {
        self.sink.borrow_mut().init(steps);
    }

    fn step(&mut self, steps: u64) {
        self.sink.borrow_mut().step(steps);
    }

    fn done(&mut self) {
        self.sink.borrow_mut().done();
    }
}

/// Per-phase sub-indicator forwarding steps to the fractional parent.
///
/// With no parent this is the null indicator: same execution path, no
/// output.
pub struct Subindicator {
    id: String,
    parent: Option<ProgressHandle>,
    steps: u64,
    current: u64,
    done: bool,
}

impl Subindicator {
    fn new(id: String, parent: Option<ProgressHandle>) -> Self {
        Self {
            id,
            parent,
            steps: 0,
            current: 0,
            done: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl ProgressIndicator for Subindicator {
    fn init(&mut self, steps: u64) {
        self.steps = steps;
        self.current = 0;
        self.done = false;
    }

    fn step(&mut self, steps: u64) {
        self.current += steps;
        if let Some(parent) = &self.parent {
            parent.borrow_mut().step(steps);
        }
    }

    fn done(&mut self) {
        self.done = true;
    }
}

/// Outer holder owning the fractional parent and one sub-indicator per
/// phase for a whole run.
pub struct RunProgress {
    parent: Option<ProgressHandle>,
    subindicators: Vec<Rc<RefCell<Subindicator>>>,
    completed: bool,
}

impl RunProgress {
    /// Null scaffolding: one null sub-indicator per phase, no parent.
    pub fn null(phase_count: usize) -> Self {
        let subindicators = (0..phase_count)
            .map(|_| Rc::new(RefCell::new(Subindicator::new(String::new(), None))))
            .collect();
        Self {
            parent: None,
            subindicators,
            completed: false,
        }
    }

    /// Real scaffolding: wraps `sink`, builds one labelled sub-indicator
    /// per phase and calls `init` on the parent.
    pub fn init(items: u64, sink: ProgressHandle, labels: Vec<String>) -> Self {
        let parent: ProgressHandle = Rc::new(RefCell::new(FractionalProgress { sink }));
        let subindicators = labels
            .into_iter()
            .map(|id| Rc::new(RefCell::new(Subindicator::new(id, Some(parent.clone())))))
            .collect();
        parent.borrow_mut().init(items);
        Self {
            parent: Some(parent),
            subindicators,
            completed: false,
        }
    }

    pub fn subindicator(&self, phase: usize) -> Rc<RefCell<Subindicator>> {
        self.subindicators[phase].clone()
    }

    /// Emit `done` on the parent. Safe to call once; dropping without
    /// calling this emits nothing.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if let Some(parent) = &self.parent {
            parent.borrow_mut().done();
        }
    }
}

/// Per-phase holder: `init`s its sub-indicator on construction, emits
/// `done` only through [`PhaseProgress::complete`]. Movable, not
/// copyable, so ownership passes cleanly through the phase loop.
pub struct PhaseProgress {
    indicator: Rc<RefCell<Subindicator>>,
}

impl PhaseProgress {
    pub fn begin(run: &RunProgress, phase: usize, steps: u64) -> Self {
        let indicator = run.subindicator(phase);
        indicator.borrow_mut().init(steps);
        Self { indicator }
    }

    /// Handle for installing on the phase's nodes.
    pub fn handle(&self) -> ProgressHandle {
        self.indicator.clone()
    }

    pub fn complete(self) {
        self.indicator.borrow_mut().done();
    }
}
