//! Batch serialization: per-phase slicing preserves shapes, op counts
//! multiply by the factor, and the phases are chained in schedule order.

mod common;

use tessel::attributes::Attributes;
use tessel::ops::catalog;
use tessel::{AnchorReturnType, DataFlow, ErrorKind, Ir, SessionOptions};

/// x[8,4] -> MatMul(w[4,4]) -> Relu -> anchored output.
fn serialized_ir(factor: i64, batch: i64) -> Ir {
    let options = SessionOptions {
        batch_serialization_factor: factor,
        ..Default::default()
    };
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let mut ir = Ir::new(dataflow, options);
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "x", &[batch, 4]);
    common::add_variable(graph, "w", &[4, 4]);
    common::wire_op(
        graph,
        catalog::MATMUL,
        Attributes::new(),
        "project",
        None,
        &["x", "w"],
        &["y"],
    );
    common::wire_op(
        graph,
        catalog::RELU,
        Attributes::new(),
        "act",
        None,
        &["y"],
        &["out"],
    );
    ir
}

#[test]
fn shard_counts_multiply_by_the_factor() {
    let mut ir = serialized_ir(4, 8);
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    assert_eq!(common::count_ops(graph, &catalog::MATMUL), 4);
    // The inplace sweep may have swapped the activations for their
    // in-place variants; the phase count is what matters.
    let relus = common::count_ops(graph, &catalog::RELU)
        + common::count_ops(graph, &catalog::RELU_INPLACE);
    assert_eq!(relus, 4);
    assert_eq!(common::count_ops(graph, &catalog::SLICE), 4);
    graph.verify().unwrap();
}

#[test]
fn phase_shapes_divide_the_batch_and_concat_restores_it() {
    let mut ir = serialized_ir(4, 8);
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    for op in graph.ops() {
        if op.operator == catalog::MATMUL {
            let phase = op.settings.batch_serialized_phase.expect("phase set");
            assert!((0..4).contains(&phase));
            let input = op.input(0).unwrap();
            assert_eq!(graph.tensor_info(input).unwrap().shape(), &[2, 4]);
        }
    }

    // The anchored whole tensor is rebuilt by a concat over the phases.
    let out = graph.tensor("out").unwrap();
    assert_eq!(out.info().unwrap().shape(), &[8, 4]);
    let producer = graph.op(out.producer().unwrap()).unwrap();
    assert!(
        producer.operator == catalog::CONCAT || producer.operator == catalog::CONCAT_INPLACE,
        "anchored output must be rebuilt by a concat, got {}",
        producer.operator
    );
    assert_eq!(producer.n_inputs(), 4);
}

#[test]
fn crystallization_chains_the_phases() {
    let mut ir = serialized_ir(4, 8);
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    let schedule = ir.op_schedule().unwrap();
    let position = |op: tessel::OpId| schedule.iter().position(|&o| o == op).unwrap();

    // All phase-k MatMuls run before phase-k+1 MatMuls.
    let mut by_phase: Vec<Option<tessel::OpId>> = vec![None; 4];
    for op in graph.ops() {
        if op.operator == catalog::MATMUL {
            by_phase[op.settings.batch_serialized_phase.unwrap() as usize] = Some(op.id);
        }
    }
    for window in by_phase.windows(2) {
        let (a, b) = (window[0].unwrap(), window[1].unwrap());
        assert!(position(a) < position(b));
    }
}

#[test]
fn indivisible_batches_are_unshardable() {
    let mut ir = serialized_ir(4, 6);
    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnshardableOp);
}

#[test]
fn dynamic_slicing_uses_indexed_windows() {
    let options = SessionOptions {
        batch_serialization_factor: 2,
        batch_serialization_dynamic: true,
        ..Default::default()
    };
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let mut ir = Ir::new(dataflow, options);
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "x", &[4, 4]);
    common::wire_op(
        graph,
        catalog::RELU,
        Attributes::new(),
        "act",
        None,
        &["x"],
        &["out"],
    );
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    assert_eq!(common::count_ops(graph, &catalog::DYNAMIC_SLICE), 2);
    assert_eq!(common::count_ops(graph, &catalog::SLICE), 0);
}
