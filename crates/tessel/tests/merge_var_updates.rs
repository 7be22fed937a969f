//! Var-update merging over a chain of convolutions sharing one constant
//! SGD configuration.

mod common;

use tessel::attributes::Attributes;
use tessel::ops::catalog;
use tessel::{
    DataFlow, Ir, Loss, MergeVarUpdatePolicy, Reduction, SessionOptions, Sgd,
};

const N_LAYERS: usize = 11;

/// Eleven stacked 1x1 convolutions with an L1 loss on the final feature
/// map; every weight sees the same constant SGD scalars.
fn conv_chain_ir(policy: MergeVarUpdatePolicy) -> Ir {
    let options = SessionOptions {
        merge_var_update: policy,
        ..Default::default()
    };
    let mut ir = Ir::new(DataFlow::new(1, []).unwrap(), options);
    let graph = ir.main_graph_mut();
    common::add_stream(graph, "act0", &[1, 2, 8, 8]);
    for layer in 0..N_LAYERS {
        let weight = format!("w{layer}");
        common::add_variable(graph, &weight, &[2, 2, 1, 1]);
        common::wire_op(
            graph,
            catalog::CONV,
            Attributes::new(),
            &format!("conv{layer}"),
            None,
            &[&format!("act{layer}"), &weight],
            &[&format!("act{}", layer + 1)],
        );
    }
    ir.add_loss(Loss::l1(
        format!("act{N_LAYERS}"),
        "loss",
        0.1,
        Reduction::Sum,
    ))
    .unwrap();
    ir.set_optimizer(Sgd::const_sgd(0.1, 0.0, 1.0)).unwrap();
    ir
}

#[test]
fn policy_none_keeps_one_update_per_weight() {
    let mut ir = conv_chain_ir(MergeVarUpdatePolicy::None);
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    assert_eq!(common::count_ops(graph, &catalog::SGD0_VAR_UPDATE), N_LAYERS);
    assert_eq!(common::count_ops(graph, &catalog::FLATTEN_INPLACE), 0);
    assert_eq!(common::count_ops(graph, &catalog::CONCAT_INPLACE), 0);
    graph.verify().unwrap();
}

#[test]
fn policy_all_fuses_the_whole_group() {
    let mut ir = conv_chain_ir(MergeVarUpdatePolicy::All);
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    // One flatten per weight and one per gradient, one concat over each,
    // one fused update.
    assert_eq!(common::count_ops(graph, &catalog::SGD0_VAR_UPDATE), 1);
    assert_eq!(
        common::count_ops(graph, &catalog::FLATTEN_INPLACE),
        2 * N_LAYERS
    );
    assert_eq!(common::count_ops(graph, &catalog::CONCAT_INPLACE), 2);

    // Every weight still feeds the fused update through its flatten.
    let update = common::find_op(graph, &catalog::SGD0_VAR_UPDATE).unwrap();
    let schedule = ir.op_schedule().unwrap();
    let update_pos = schedule.iter().position(|&o| o == update).unwrap();
    for layer in 0..N_LAYERS {
        let weight = format!("w{layer}");
        for consumer in graph.tensor(&weight).unwrap().consumers.ops() {
            let pos = schedule.iter().position(|&o| o == consumer).unwrap();
            assert!(pos <= update_pos || consumer == update);
        }
    }
    graph.verify().unwrap();
}

#[test]
fn policy_auto_tight_partitions_by_threshold() {
    // Eleven 16-byte weights with a 48-byte budget: ceil(176 / 48) = 4
    // fused groups.
    let mut ir = conv_chain_ir(MergeVarUpdatePolicy::AutoTight { threshold_bytes: 48 });
    ir.prepare().unwrap();
    let graph = ir.main_graph();
    assert_eq!(common::count_ops(graph, &catalog::SGD0_VAR_UPDATE), 4);
    graph.verify().unwrap();
}
