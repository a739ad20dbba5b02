//! End-to-end scenarios for the pipeline runtime.
//!
//! Each test builds a node map through the harness, runs it, and
//! asserts lifecycle traces, resource assignments or progress
//! notifications.

use sluice_runtime::{DatastructureSpec, Error, NodeId, Relation, ResourceKind, UNBOUNDED};
use sluice_tests::{NodeSpec, TestHarness};

const MIB: u64 = 1 << 20;

#[test]
fn test_single_node_pipeline() {
    let mut harness = TestHarness::new();
    let node = harness.add(
        NodeSpec::new("only")
            .memory(0, UNBOUNDED, 1.0)
            .files(0, UNBOUNDED, 1.0),
    );

    harness.run(100, 8, MIB).unwrap();

    assert_eq!(
        harness.trace(),
        vec![
            "prepare only",
            "propagate only",
            "begin only",
            "go only",
            "end only",
        ]
    );
    assert_eq!(harness.assigned(node, ResourceKind::Memory), MIB);
    assert_eq!(harness.assigned(node, ResourceKind::Files), 8);
    assert_eq!(harness.progress_inits(), vec![100]);
    assert_eq!(harness.progress_dones(), 1);
}

#[test]
fn test_push_pipeline_lifecycle_order() {
    // a pushes to b pushes to c: one phase, initiator a, begin called
    // leaves first and end roots first.
    let mut harness = TestHarness::new();
    let a = harness.add_named("a");
    let b = harness.add_named("b");
    let c = harness.add_named("c");
    harness.relate(a, b, Relation::Pushes);
    harness.relate(b, c, Relation::Pushes);

    harness.run(0, 8, MIB).unwrap();

    assert_eq!(
        harness.trace(),
        vec![
            "prepare a",
            "prepare b",
            "prepare c",
            "propagate a",
            "propagate b",
            "propagate c",
            "begin c",
            "begin b",
            "begin a",
            "go a",
            "end a",
            "end b",
            "end c",
        ]
    );
}

#[test]
fn test_depends_creates_two_phases() {
    // b depends on a: two phases, both single-node initiators; all
    // prepares happen before any propagate.
    let mut harness = TestHarness::new();
    let a = harness.add_named("a");
    let b = harness.add_named("b");
    harness.relate(b, a, Relation::Depends);

    harness.run(0, 8, MIB).unwrap();

    assert_eq!(
        harness.trace(),
        vec![
            "prepare a",
            "prepare b",
            "propagate a",
            "begin a",
            "go a",
            "end a",
            "propagate b",
            "begin b",
            "go b",
            "end b",
        ]
    );
}

#[test]
fn test_green_edge_infeasible_is_rejected() {
    // c shares a's memory and a cannot evacuate, but b must run between
    // their phases: the mandatory adjacency cannot hold.
    let mut harness = TestHarness::new();
    let a = harness.add_named("a");
    let b = harness.add_named("b");
    let c = harness.add_named("c");
    harness.relate(c, a, Relation::MemoryShareDepends);
    harness.relate(b, a, Relation::Depends);
    harness.relate(c, b, Relation::Depends);

    assert!(matches!(
        harness.run(0, 8, MIB),
        Err(Error::GreenEdgesUnsatisfiable)
    ));
    // Nothing ran.
    assert!(harness.trace().is_empty());
}

#[test]
fn test_red_edges_are_both_satisfied() {
    // Red edges (a, b) and (c, d) plus black a -> c: the order
    // a, b, c, d keeps both memory-share pairs adjacent, so nothing is
    // evacuated.
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").evacuatable());
    let b = harness.add_named("b");
    let c = harness.add(NodeSpec::new("c").evacuatable());
    let d = harness.add_named("d");
    harness.relate(b, a, Relation::MemoryShareDepends);
    harness.relate(d, c, Relation::MemoryShareDepends);
    harness.relate(c, a, Relation::Depends);

    harness.run(0, 8, MIB).unwrap();

    let trace = harness.trace();
    let go_order: Vec<&String> = trace.iter().filter(|e| e.starts_with("go")).collect();
    assert_eq!(go_order, ["go a", "go b", "go c", "go d"]);
    assert!(!trace.iter().any(|e| e.starts_with("evacuate")));
}

#[test]
fn test_unsatisfied_memory_share_evacuates_producer() {
    // c shares a's memory but b's phase must run in between; a is
    // evacuated once its phase is done.
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").evacuatable());
    let b = harness.add_named("b");
    let c = harness.add_named("c");
    harness.relate(b, a, Relation::Depends);
    harness.relate(c, b, Relation::Depends);
    harness.relate(c, a, Relation::MemoryShareDepends);

    harness.run(0, 8, MIB).unwrap();

    let trace = harness.trace();
    let evacuated = trace.iter().position(|e| e == "evacuate a").unwrap();
    let end_a = trace.iter().position(|e| e == "end a").unwrap();
    let propagate_b = trace.iter().position(|e| e == "propagate b").unwrap();
    assert!(end_a < evacuated);
    assert!(evacuated < propagate_b);
}

#[test]
fn test_fractions_share_the_budget() {
    // One phase, three nodes with fractions 1, 2 and 3 over a budget of
    // 60 bytes.
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").memory(0, UNBOUNDED, 1.0));
    let b = harness.add(NodeSpec::new("b").memory(0, UNBOUNDED, 2.0));
    let c = harness.add(NodeSpec::new("c").memory(0, UNBOUNDED, 3.0));
    harness.relate(a, b, Relation::Pushes);
    harness.relate(b, c, Relation::Pushes);

    harness.run(0, 8, 60).unwrap();

    assert_eq!(harness.assigned(a, ResourceKind::Memory), 10);
    assert_eq!(harness.assigned(b, ResourceKind::Memory), 20);
    assert_eq!(harness.assigned(c, ResourceKind::Memory), 30);
    assert_eq!(harness.total_assigned(ResourceKind::Memory), 60);
}

#[test]
fn test_budget_is_respected_per_phase() {
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").memory(100, 5000, 1.0).files(1, 4, 1.0));
    let b = harness.add(NodeSpec::new("b").memory(0, UNBOUNDED, 4.0).files(0, 2, 2.0));
    let c = harness.add(NodeSpec::new("c").memory(50, 50, 1.0).files(2, 8, 0.5));
    harness.relate(a, b, Relation::Pushes);
    harness.relate(b, c, Relation::Pushes);

    harness.run(0, 8, 10_000).unwrap();

    for (id, minimum, maximum) in [(a, 100, 5000), (b, 0, UNBOUNDED), (c, 50, 50)] {
        let assigned = harness.assigned(id, ResourceKind::Memory);
        assert!(assigned >= minimum);
        assert!(assigned <= maximum);
    }
    assert!(harness.total_assigned(ResourceKind::Memory) <= 10_000);
    assert!(harness.total_assigned(ResourceKind::Files) <= 8);
}

#[test]
fn test_starved_phase_runs_at_minimums() {
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").memory(40, UNBOUNDED, 1.0));
    let b = harness.add(NodeSpec::new("b").memory(30, UNBOUNDED, 1.0));
    harness.relate(a, b, Relation::Pushes);

    // 40 + 30 > 60: degraded, not fatal.
    harness.run(0, 8, 60).unwrap();

    assert_eq!(harness.assigned(a, ResourceKind::Memory), 40);
    assert_eq!(harness.assigned(b, ResourceKind::Memory), 30);
    assert_eq!(harness.trace().iter().filter(|e| e.starts_with("go")).count(), 1);
}

#[test]
fn test_datastructure_spans_phases() {
    // Both phases reference the same data structure; it competes with
    // the nodes for memory in each phase and ends up committed in the
    // node map's slot store.
    let spec = DatastructureSpec {
        minimum: 0,
        maximum: UNBOUNDED,
        priority: 1.0,
    };
    let mut harness = TestHarness::new();
    let a = harness.add(
        NodeSpec::new("a")
            .memory(0, UNBOUNDED, 1.0)
            .datastructure("table", spec),
    );
    let b = harness.add(
        NodeSpec::new("b")
            .memory(0, UNBOUNDED, 3.0)
            .datastructure("table", spec),
    );
    harness.relate(b, a, Relation::Depends);

    harness.run(0, 8, 100).unwrap();

    // Phase of b: fractions 3 + 1 over 100 locks the table at 25.
    let table = &harness.map().datastructures()["table"];
    assert_eq!(table.assigned, 25);
    assert_eq!(harness.assigned(b, ResourceKind::Memory), 75);
    // Phase of a shares with the locked table.
    assert_eq!(harness.assigned(a, ResourceKind::Memory), 75);
}

#[test]
fn test_progress_counts_steps_across_phases() {
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").steps(10));
    let b = harness.add(NodeSpec::new("b").steps(5));
    harness.relate(b, a, Relation::Depends);

    harness.run(15, 8, MIB).unwrap();

    assert_eq!(harness.progress_inits(), vec![15]);
    assert_eq!(harness.progress_steps(), 15);
    assert_eq!(harness.progress_dones(), 1);
}

#[test]
fn test_failed_phase_reports_no_completion() {
    let mut harness = TestHarness::new();
    let a = harness.add(NodeSpec::new("a").failing_in("go"));
    let b = harness.add_named("b");
    harness.relate(b, a, Relation::Depends);

    let error = harness.run(0, 8, MIB).unwrap_err();
    assert!(matches!(error, Error::NodeFailure { stage: "go", .. }));

    let trace = harness.trace();
    assert!(trace.contains(&"begin a".to_string()));
    assert!(!trace.iter().any(|e| e.starts_with("end")));
    assert_eq!(harness.progress_dones(), 0);
}

#[test]
fn test_go_until_hands_control_to_the_caller() {
    let mut harness = TestHarness::new();
    let a = harness.add_named("a");
    let b = harness.add_named("b");
    harness.relate(b, a, Relation::Depends);

    let sink = harness.progress_sink();
    let mut runtime = harness.runtime();
    let mut context = runtime.go_init(0, sink, 8, MIB, None).unwrap();
    assert_eq!(context.phases().len(), 2);

    // Stop when b's phase is about to run its initiators: a's phase
    // completes, b is begun but not driven.
    runtime.go_until(&mut context, Some(b)).unwrap();
    runtime.go_until(&mut context, None).unwrap();
    drop(runtime);

    assert_eq!(
        harness.trace(),
        vec![
            "prepare a",
            "prepare b",
            "propagate a",
            "begin a",
            "go a",
            "end a",
            "propagate b",
            "begin b",
            "end b",
        ]
    );
}

#[test]
fn test_execution_is_deterministic() {
    let build = || {
        let mut harness = TestHarness::new();
        let a = harness.add(NodeSpec::new("a").evacuatable());
        let b = harness.add_named("b");
        let c = harness.add(NodeSpec::new("c").evacuatable());
        let d = harness.add_named("d");
        let e = harness.add_named("e");
        harness.relate(a, e, Relation::Pushes);
        harness.relate(b, a, Relation::MemoryShareDepends);
        harness.relate(d, c, Relation::MemoryShareDepends);
        harness.relate(c, a, Relation::Depends);
        harness.relate(d, b, Relation::NoForwardDepends);
        harness
    };

    let mut first = build();
    first.run(0, 8, MIB).unwrap();
    let mut second = build();
    second.run(0, 8, MIB).unwrap();

    assert_eq!(first.trace(), second.trace());
    assert!(!first.trace().is_empty());
}

#[test]
fn test_empty_pipeline_is_rejected() {
    let mut harness = TestHarness::new();
    assert!(matches!(harness.run(0, 8, MIB), Err(Error::EmptyPipeline)));
}

#[test]
fn test_item_sources_and_sinks() {
    let mut harness = TestHarness::new();
    let a = harness.add_named("a");
    let b = harness.add_named("b");
    let c = harness.add_named("c");
    harness.relate(a, b, Relation::Pushes);
    harness.relate(b, c, Relation::Pushes);

    let runtime = harness.runtime();
    assert_eq!(runtime.item_sources(), vec![NodeId(0)]);
    assert_eq!(runtime.item_sinks(), vec![NodeId(2)]);
}
