//! Recomputation: user annotations and the Standard strategy tag forward
//! ops, and tagged ops grow late-scheduled shadow clones for the backward
//! pass.

mod common;

use tessel::attributes::Attributes;
use tessel::op::RecomputeKind;
use tessel::ops::catalog;
use tessel::tensor::reserved;
use tessel::{DataFlow, Ir, Loss, Reduction, RecomputationStrategy, SessionOptions, Sgd};

fn chain_ir(strategy: RecomputationStrategy) -> Ir {
    let options = SessionOptions {
        auto_recomputation: strategy,
        ..Default::default()
    };
    let mut ir = Ir::new(DataFlow::new(1, []).unwrap(), options);
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
        &["a"],
    );
    common::wire_op(graph, catalog::RELU, Attributes::new(), "act", None, &["a"], &["b"]);
    common::wire_op(
        graph,
        catalog::SQUARE,
        Attributes::new(),
        "sq",
        None,
        &["b"],
        &["c"],
    );
    ir.add_loss(Loss::l1("c", "loss", 0.1, Reduction::Sum)).unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir
}

#[test]
fn user_annotation_grows_a_shadow_clone() {
    let mut ir = chain_ir(RecomputationStrategy::Standard);
    // Tag the activation by hand; user annotations win over the automatic
    // strategy.
    let graph = ir.main_graph_mut();
    let relu = graph
        .ops()
        .find(|op| op.operator == catalog::RELU)
        .map(|op| op.id)
        .unwrap();
    graph.op_mut(relu).unwrap().settings.recompute = RecomputeKind::Recompute;
    ir.prepare().unwrap();

    let graph = ir.main_graph();
    // The backward consumers of the activation read the recomputed copy.
    let recomputed = reserved::recompute_id("b");
    assert!(graph.tensors.contains(&recomputed), "shadow output missing");
    let clone = graph.tensor(&recomputed).unwrap().producer().unwrap();
    let clone_op = graph.op(clone).unwrap();
    assert!(
        clone_op.operator == catalog::RELU || clone_op.operator == catalog::RELU_INPLACE
    );
    // The shadow runs as late as the scheduler allows.
    assert_eq!(clone_op.settings.priority, f64::MIN);

    let square_grad = common::find_op(graph, &catalog::SQUARE_GRAD).unwrap();
    assert_eq!(graph.op(square_grad).unwrap().input(1).unwrap(), &recomputed);
    graph.verify().unwrap();
}

#[test]
fn standard_strategy_tags_every_forward_op() {
    let mut ir = chain_ir(RecomputationStrategy::Standard);
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    for op in graph.ops() {
        // Forward ops all carry a decision after the transform; backward
        // ops are untouched.
        if op.path_to_loss == tessel::op::LossRelation::Yes
            && op.from_loss == tessel::op::LossRelation::No
            && !op.operator.is_accel()
        {
            assert_ne!(
                op.settings.recompute,
                RecomputeKind::Undefined,
                "{} was not classified",
                op.debug_name()
            );
        }
    }
}
