//! Pipelining: contiguated cross-stage copies, stash/restore insertion and
//! the minimum-depth check.

mod common;

use tessel::attributes::Attributes;
use tessel::op::OpSettings;
use tessel::ops::catalog;
use tessel::{DataFlow, ErrorKind, Ir, Loss, Reduction, SessionOptions, Sgd};

/// x -> Mul(w) on tile 0 -> Relu on tile 1 -> Relu on tile 2 -> L1 loss.
fn staged_ir(batches_per_step: i64) -> Ir {
    let options = SessionOptions {
        enable_pipelining: true,
        ..Default::default()
    };
    let mut ir = Ir::new(DataFlow::new(batches_per_step, []).unwrap(), options);
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "x", &[4, 4]);
    common::add_variable(graph, "w", &[4, 4]);
    common::wire_op(
        graph,
        catalog::MUL,
        Attributes::new(),
        "scale_in",
        Some(0),
        &["x", "w"],
        &["a0"],
    );
    common::wire_op(
        graph,
        catalog::RELU,
        Attributes::new(),
        "relu1",
        Some(1),
        &["a0"],
        &["a1"],
    );
    common::wire_op(
        graph,
        catalog::RELU,
        Attributes::new(),
        "relu2",
        Some(2),
        &["a1"],
        &["a2"],
    );
    ir.add_loss(Loss::l1("a2", "loss", 0.1, Reduction::Sum)).unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir
}

#[test]
fn every_copy_advances_exactly_one_stage() {
    let mut ir = staged_ir(5);
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    let copies: Vec<_> = graph
        .ops()
        .filter(|op| op.operator == catalog::TILE_COPY)
        .map(|op| op.id)
        .collect();
    assert!(!copies.is_empty(), "cross-tile edges must be copied");
    for copy in copies {
        let stage = graph.op(copy).unwrap().settings.pipeline_stage.unwrap();
        let out = graph.op(copy).unwrap().output(0).unwrap().clone();
        for consumer in graph.tensor(&out).unwrap().consumers.ops() {
            let consumer_stage = graph
                .op(consumer)
                .unwrap()
                .settings
                .pipeline_stage
                .unwrap();
            assert_eq!(
                consumer_stage,
                stage + 1,
                "copy at stage {stage} must land exactly one stage later"
            );
        }
    }
}

#[test]
fn stash_depths_follow_the_ring_buffer_formula() {
    let mut ir = staged_ir(5);
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    let mut stashed: Vec<(String, i64)> = Vec::new();
    for op in graph.ops().filter(|op| op.operator == catalog::STASH) {
        let activation = op.input(0).unwrap().clone();
        let size = op.attrs.int("stash_size").unwrap();
        let stash_stage = op.settings.pipeline_stage.unwrap();

        // Find the paired restore through the stash buffer tensor.
        let buffer = op.output(0).unwrap();
        let restore = graph.tensor(buffer).unwrap().consumers.ops()[0];
        let restore_stage = graph
            .op(restore)
            .unwrap()
            .settings
            .pipeline_stage
            .unwrap();
        assert_eq!(size, 2 * (restore_stage - stash_stage) + 1);
        stashed.push((activation, size));
    }

    // The stage-1 activation is restored at its backward stage 3: depth 5.
    assert!(
        stashed.iter().any(|(t, size)| t == "a1" && *size == 5),
        "expected a depth-5 stash of a1, got {stashed:?}"
    );
    graph.verify().unwrap();
}

#[test]
fn single_stage_delta_stashes_with_depth_three() {
    // An activation produced at stage 0 and consumed at stage 1 on the
    // same tile needs a ring buffer of depth 3.
    let options = SessionOptions {
        enable_pipelining: true,
        ..Default::default()
    };
    let mut ir = Ir::new(DataFlow::new(3, []).unwrap(), options);
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "x", &[4]);
    common::add_variable(graph, "w", &[4]);
    common::wire_op(
        graph,
        catalog::MUL,
        Attributes::new(),
        "mul",
        Some(0),
        &["x", "w"],
        &["a"],
    );
    let mut late = OpSettings::named("late_square");
    late.virtual_graph_id = Some(0);
    late.pipeline_stage = Some(1);
    let square = graph.add_op(catalog::SQUARE, Attributes::new(), late);
    graph.connect_in(square, 0, "a").unwrap();
    graph.create_and_connect_out(square, 0, "b").unwrap();
    graph.setup_op(square).unwrap();
    ir.add_loss(Loss::l1("b", "loss", 0.1, Reduction::Sum)).unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir.prepare().unwrap();

    let graph = ir.main_graph();
    let stash = graph
        .ops()
        .find(|op| op.operator == catalog::STASH && op.input(0).unwrap() == "a")
        .expect("the stage-crossing activation is stashed");
    assert_eq!(stash.attrs.int("stash_size").unwrap(), 3);
}

#[test]
fn shallow_batches_fail_the_depth_check() {
    let mut ir = staged_ir(4);
    let err = ir.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientPipelineDepth);
}
