//! Whole-pipeline invariants checked on a prepared training graph:
//! schedule correctness, pruning idempotence, store consistency.

mod common;

use std::collections::HashMap;

use tessel::attributes::{AttrValue, Attributes};
use tessel::ops::catalog;
use tessel::transforms::{Prune, Transform};
use tessel::{DataFlow, Ir, Loss, OpId, Reduction, SessionOptions, Sgd};

/// A small training graph with a fan-out: the activation feeds both a
/// scaled branch and a direct branch, so its gradient is a real sum.
fn fanout_training_ir() -> Ir {
    let mut ir = Ir::new(DataFlow::new(1, []).unwrap(), SessionOptions::default());
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "x", &[4, 4]);
    common::add_variable(graph, "w", &[4, 4]);
    common::wire_op(
        graph,
        catalog::MUL,
        Attributes::new(),
        "pre",
        None,
        &["x", "w"],
        &["act"],
    );
    common::wire_op(
        graph,
        catalog::SCALE,
        Attributes::new().with("scale", AttrValue::Float(2.0)),
        "branch_a",
        None,
        &["act"],
        &["scaled"],
    );
    common::wire_op(
        graph,
        catalog::ADD,
        Attributes::new(),
        "join",
        None,
        &["scaled", "act"],
        &["joined"],
    );
    ir.add_loss(Loss::l1("joined", "loss", 0.1, Reduction::Sum))
        .unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir
}

#[test]
fn schedule_respects_every_edge_and_constraint() {
    let mut ir = fanout_training_ir();
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    let schedule = ir.op_schedule().unwrap();
    let position: HashMap<OpId, usize> = schedule
        .iter()
        .enumerate()
        .map(|(index, &op)| (op, index))
        .collect();
    assert_eq!(position.len(), graph.n_ops());

    for op in graph.ops() {
        for (_, tensor) in op.outputs() {
            for consumer in graph.tensor(tensor).unwrap().consumers.ops() {
                assert!(
                    position[&op.id] < position[&consumer],
                    "{} produces for {} but is scheduled after it",
                    op.debug_name(),
                    consumer
                );
            }
        }
    }
    for (before, after) in graph.topo_cons.iter() {
        assert!(position[&before] < position[&after]);
    }
}

#[test]
fn fanout_gradient_is_summed_once() {
    let mut ir = fanout_training_ir();
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    // `act` fans out to two consumers, so its gradient is the sum of two
    // partials; the two-input Sum survives the unary-sum cleanup.
    let grad_act = tessel::tensor::reserved::grad_id("act");
    let producer = graph
        .tensor(&grad_act)
        .unwrap()
        .producer()
        .expect("summed gradient");
    let sum = graph.op(producer).unwrap();
    assert_eq!(sum.operator, catalog::SUM);
    assert_eq!(sum.n_inputs(), 2);
}

#[test]
fn pruning_is_idempotent_after_prepare() {
    let mut ir = fanout_training_ir();
    ir.prepare().unwrap();
    // The prepared graph was already pruned; nothing further to remove,
    // no matter how often it reruns.
    assert!(!Prune.apply(&mut ir).unwrap());
    assert!(!Prune.apply(&mut ir).unwrap());
}

#[test]
fn store_invariants_hold_after_prepare() {
    let mut ir = fanout_training_ir();
    ir.prepare().unwrap();
    ir.main_graph().verify().unwrap();
}

#[test]
fn weights_io_round_trips_variable_bytes() {
    let mut ir = fanout_training_ir();
    ir.prepare().unwrap();
    let mut io = ir.weights_io();
    assert!(io.contains("w"));
    assert!(!io.contains("x"));

    let fresh: Vec<u8> = (0..64).map(|b| b as u8).collect();
    io.write("w", &fresh).unwrap();
    let (info, bytes) = io.weight("w").unwrap();
    assert_eq!(info.shape(), &[4, 4]);
    assert_eq!(bytes, fresh.as_slice());

    let err = io.write("w", &[0u8; 3]).unwrap_err();
    assert_eq!(err.kind(), tessel::ErrorKind::ShapeMismatch);
}
