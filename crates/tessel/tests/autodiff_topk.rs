//! Backward growth through a top-k selection: the gradient scatters into
//! the selected positions only, scaled by the squared-activation chain.

mod common;

use tessel::attributes::{AttrValue, Attributes};
use tessel::ops::catalog;
use tessel::tensor::reserved;
use tessel::{DataFlow, Ir, Loss, Reduction, SessionOptions, Sgd};

fn topk_training_ir() -> Ir {
    let mut ir = Ir::new(DataFlow::new(1, []).unwrap(), SessionOptions::default());
    let graph = ir.main_graph_mut();
    common::add_variable(graph, "x", &[3, 7, 2, 5]);
    common::wire_op(
        graph,
        catalog::TOPK,
        Attributes::new()
            .with("axis", AttrValue::Int(1))
            .with("k", AttrValue::Int(3)),
        "topk",
        None,
        &["x"],
        &["topk_vals", "topk_idx"],
    );
    common::wire_op(
        graph,
        catalog::SQUARE,
        Attributes::new(),
        "square",
        None,
        &["topk_vals"],
        &["squared"],
    );
    common::wire_op(
        graph,
        catalog::SCALE,
        Attributes::new().with("scale", AttrValue::Float(3.0)),
        "scale3",
        None,
        &["squared"],
        &["scaled"],
    );
    ir.add_loss(Loss::l1("scaled", "loss", 0.26, Reduction::Sum))
        .unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir
}

#[test]
fn topk_gradient_scatters_into_selected_positions() {
    let mut ir = topk_training_ir();
    ir.prepare().unwrap();
    let graph = ir.main_graph();

    assert_eq!(graph.tensor_info("topk_vals").unwrap().shape(), &[3, 3, 2, 5]);

    // The scatter-style gradient op reads the selected indices and
    // rebuilds the full input shape.
    let topk_grad = common::find_op(graph, &catalog::TOPK_GRAD).expect("one TopKGrad");
    let grad_op = graph.op(topk_grad).unwrap();
    assert_eq!(grad_op.attrs.int("axis").unwrap(), 1);
    assert_eq!(
        grad_op.attrs.ints("target_shape").unwrap(),
        &[3, 7, 2, 5]
    );
    assert_eq!(grad_op.input(1).unwrap(), "topk_idx");

    // The gradient chain pulls back through scale and square: one L1Grad
    // seed, one scale-by-3 grad, one SquareGrad.
    assert_eq!(common::count_ops(graph, &catalog::L1_GRAD), 1);
    assert_eq!(common::count_ops(graph, &catalog::SQUARE_GRAD), 1);

    // The weight gradient exists and drives exactly one update.
    let grad_x = reserved::grad_id("x");
    assert!(graph.tensors.contains(&grad_x));
    let update = common::find_op(graph, &catalog::SGD0_VAR_UPDATE).expect("one update");
    let update_op = graph.op(update).unwrap();
    assert_eq!(update_op.input(0).unwrap(), "x");
    assert_eq!(update_op.input(1).unwrap(), &grad_x);

    graph.verify().unwrap();
}

#[test]
fn schedule_orders_forward_before_backward() {
    let mut ir = topk_training_ir();
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    let schedule = ir.op_schedule().unwrap();
    let position = |op: tessel::OpId| schedule.iter().position(|&o| o == op).unwrap();

    let topk = common::find_op(graph, &catalog::TOPK).unwrap();
    let topk_grad = common::find_op(graph, &catalog::TOPK_GRAD).unwrap();
    let update = common::find_op(graph, &catalog::SGD0_VAR_UPDATE).unwrap();
    assert!(position(topk) < position(topk_grad));
    assert!(position(topk_grad) < position(update));

    // The var update is the topologically last consumer of the weight.
    for consumer in graph.tensor("x").unwrap().consumers.ops() {
        if consumer != update {
            assert!(position(consumer) < position(update));
        }
    }
}

#[test]
fn gradients_are_produced_exactly_once() {
    let mut ir = topk_training_ir();
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    // Each tensor on the backward path has a single producer for its
    // canonical gradient; the store enforces uniqueness, so existence is
    // the whole check.
    for tensor in ["topk_vals", "squared", "scaled"] {
        let grad = reserved::grad_id(tensor);
        assert!(
            graph.tensors.contains(&grad),
            "missing gradient for {tensor}"
        );
        assert!(graph.tensor(&grad).unwrap().has_producer());
    }
}
