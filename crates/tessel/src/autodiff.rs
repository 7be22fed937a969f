//! Backward-graph construction: path marking, reverse growth of grad ops,
//! gradient summation at fan-outs and var-update synthesis.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::attributes::Attributes;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::ir::Ir;
use crate::op::{LossRelation, OpId, OpSettings};
use crate::ops::{self, catalog, GradOpSpec, GradSource};
use crate::scheduler;
use crate::tensor::{reserved, TensorClass, TensorId};

/// Work-in-progress state of the reverse sweep.
struct GradGrowth {
    /// Per forward tensor: partial gradients produced so far.
    partials: BTreeMap<TensorId, Vec<TensorId>>,
    /// Per forward tensor: number of gradient edges expected before the
    /// partials can be summed.
    expected: HashMap<TensorId, usize>,
    /// Per forward op: outputs whose gradient is complete.
    complete_outputs: HashMap<OpId, usize>,
    /// Per forward op: outputs that lie on a path to a loss.
    on_path_outputs: HashMap<OpId, usize>,
    /// Ops whose grad ops have been grown (exactly-once discipline).
    differentiated: HashSet<OpId>,
    /// LIFO of ops ready to have their grad ops grown; seeded so grad ops
    /// of later forward ops grow first.
    ready: Vec<OpId>,
}

/// Derives the backward graph and weight updates for every loss in `ir`.
pub fn grow_backward(ir: &mut Ir) -> Result<()> {
    let optimizer = ir
        .optimizer()
        .cloned()
        .ok_or_else(|| error!(ErrorKind::UnreachableLoss, "training without an optimizer"))?;
    let accumulation = ir.options().enable_gradient_accumulation;
    let graph = ir.main_graph_mut();

    let loss_ops: Vec<OpId> = graph
        .ops()
        .filter(|op| {
            ops::opdef(&op.operator)
                .map(|def| def.flags.loss)
                .unwrap_or(false)
        })
        .map(|op| op.id)
        .collect();
    if loss_ops.is_empty() {
        return Err(error!(
            ErrorKind::UnreachableLoss,
            "training requested but the graph grew no loss ops"
        ));
    }

    let on_path = mark_paths_to_loss(graph, &loss_ops)?;
    let mut growth = prime_growth(graph, &on_path, &loss_ops)?;

    // Seed: loss ops grow their grad ops unconditionally, in forward
    // schedule order so the stack pops the latest first.
    let schedule = scheduler::op_schedule(graph)?;
    for &op in &schedule {
        if loss_ops.contains(&op) {
            growth.ready.push(op);
        }
    }

    let mut var_updates: Vec<(TensorId, TensorId)> = Vec::new();
    while let Some(op) = growth.ready.pop() {
        if !growth.differentiated.insert(op) {
            continue;
        }
        grow_grad_ops(graph, op, &mut growth, &mut var_updates)?;
    }

    for (weight, grad) in var_updates {
        debug!(weight = weight.as_str(), "growing var update");
        let grown = optimizer.grow_var_update(graph, &weight, &grad, accumulation)?;
        for op in grown {
            graph.op_mut(op)?.from_loss = LossRelation::Yes;
        }
    }
    Ok(())
}

/// Marks every op on a directed path into a loss op with
/// `path_to_loss = Yes` and everything else `No`; ops also get their
/// `from_loss` default of `No`. Returns the on-path op set.
fn mark_paths_to_loss(graph: &mut Graph, loss_ops: &[OpId]) -> Result<HashSet<OpId>> {
    let mut on_path: HashSet<OpId> = loss_ops.iter().copied().collect();
    let mut frontier: Vec<OpId> = loss_ops.to_vec();
    let mut variables_reach_loss = false;
    while let Some(op) = frontier.pop() {
        let inputs = graph.op(op)?.input_ids();
        for tensor in inputs {
            let t = graph.tensor(&tensor)?;
            if t.class == TensorClass::Variable {
                variables_reach_loss = true;
            }
            if let Some(producer) = t.producer {
                if on_path.insert(producer) {
                    frontier.push(producer);
                }
            }
        }
    }
    if !variables_reach_loss {
        return Err(error!(
            ErrorKind::UnreachableLoss,
            "no Variable tensor lies on a path to any loss"
        ));
    }
    for id in graph.op_ids() {
        let op = graph.op_mut(id)?;
        op.path_to_loss = if on_path.contains(&id) {
            LossRelation::Yes
        } else {
            LossRelation::No
        };
        op.from_loss = LossRelation::No;
    }
    Ok(on_path)
}

/// Computes the per-tensor expected gradient-edge counts and the per-op
/// on-path output counts, by asking every on-path op which of its inputs
/// its grad ops will actually produce gradients for.
fn prime_growth(
    graph: &Graph,
    on_path: &HashSet<OpId>,
    loss_ops: &[OpId],
) -> Result<GradGrowth> {
    let mut expected: HashMap<TensorId, usize> = HashMap::new();
    for &op_id in on_path {
        let op = graph.op(op_id)?;
        let def = ops::opdef(&op.operator)?;
        let Some(grad) = def.grad else {
            return Err(error!(
                ErrorKind::NonDifferentiable,
                "op {} lies on a path to a loss but has no gradient",
                op.debug_name()
            ));
        };
        let specs = grad(op, graph)?;
        for spec in &specs {
            for &(_, fwd_in) in &spec.grad_out_to_fwd_in {
                let tensor = op.input(fwd_in)?.clone();
                *expected.entry(tensor).or_insert(0) += 1;
            }
        }
    }

    let mut on_path_outputs: HashMap<OpId, usize> = HashMap::new();
    for &op_id in on_path {
        if loss_ops.contains(&op_id) {
            continue;
        }
        let op = graph.op(op_id)?;
        let mut count = 0;
        for (_, tensor) in op.outputs() {
            if expected_through(graph, tensor, on_path, &expected)? {
                count += 1;
            }
        }
        on_path_outputs.insert(op_id, count);
    }

    Ok(GradGrowth {
        partials: BTreeMap::new(),
        expected,
        complete_outputs: HashMap::new(),
        on_path_outputs,
        differentiated: HashSet::new(),
        ready: Vec::new(),
    })
}

/// An output tensor carries gradient iff some on-path consumer's grad ops
/// will feed it.
fn expected_through(
    graph: &Graph,
    tensor: &str,
    on_path: &HashSet<OpId>,
    expected: &HashMap<TensorId, usize>,
) -> Result<bool> {
    if !expected.contains_key(tensor) {
        return Ok(false);
    }
    for consumer in graph.tensor(tensor)?.consumers.ops() {
        if on_path.contains(&consumer) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Instantiates the grad ops of one ready forward op, connecting their
/// inputs per the grad specs and registering the produced partials.
fn grow_grad_ops(
    graph: &mut Graph,
    fwd: OpId,
    growth: &mut GradGrowth,
    var_updates: &mut Vec<(TensorId, TensorId)>,
) -> Result<()> {
    let fwd_op = graph.op(fwd)?.clone();
    let def = ops::opdef(&fwd_op.operator)?;
    let grad = def.grad.ok_or_else(|| {
        error!(
            ErrorKind::NonDifferentiable,
            "op {} is on a loss path but has no gradient",
            fwd_op.debug_name()
        )
    })?;
    let specs: Vec<GradOpSpec> = grad(&fwd_op, graph)?;
    debug!(fwd = fwd_op.debug_name().as_str(), grads = specs.len(), "growing grad ops");

    for spec in specs {
        let mut settings = OpSettings::named(format!("{}_grad", fwd_op.settings.name));
        settings.virtual_graph_id = fwd_op.settings.virtual_graph_id;
        let grad_op = graph.add_op(spec.operator.clone(), spec.attrs.clone(), settings);

        for input in &spec.grad_inputs {
            let tensor: TensorId = match input.source {
                GradSource::GradOfOutput => {
                    let output = fwd_op.output(input.fwd_index)?;
                    let grad_tensor = reserved::grad_id(output);
                    if !graph.tensors.contains(&grad_tensor) {
                        return Err(error!(
                            ErrorKind::IncompleteGrad,
                            "grad of {output} required by {} is not yet produced",
                            fwd_op.debug_name()
                        ));
                    }
                    grad_tensor
                }
                GradSource::Output => fwd_op.output(input.fwd_index)?.clone(),
                GradSource::Input => fwd_op.input(input.fwd_index)?.clone(),
            };
            graph.connect_in(grad_op, input.grad_in, &tensor)?;
        }

        for &(out_index, fwd_in) in &spec.grad_out_to_fwd_in {
            let target = fwd_op.input(fwd_in)?.clone();
            let partial = reserved::edge_grad_id(&target, grad_op, out_index);
            graph.create_and_connect_out(grad_op, out_index, &partial)?;
        }
        graph.setup_op(grad_op)?;
        graph.op_mut(grad_op)?.from_loss = LossRelation::Yes;

        for &(out_index, fwd_in) in &spec.grad_out_to_fwd_in {
            let target = fwd_op.input(fwd_in)?.clone();
            let partial = graph.op(grad_op)?.output(out_index)?.clone();
            register_partial(graph, &target, partial, growth, var_updates)?;
        }
    }
    Ok(())
}

/// Records one partial gradient of `target`; when the expected edge count
/// is reached, materializes the gradient sum and propagates readiness.
fn register_partial(
    graph: &mut Graph,
    target: &str,
    partial: TensorId,
    growth: &mut GradGrowth,
    var_updates: &mut Vec<(TensorId, TensorId)>,
) -> Result<()> {
    growth
        .partials
        .entry(target.to_string())
        .or_default()
        .push(partial);
    let expected = growth.expected.get(target).copied().ok_or_else(|| {
        error!(
            ErrorKind::IncompleteGrad,
            "partial gradient arrived for {target}, which expects none"
        )
    })?;
    let partials = &growth.partials[target];
    if partials.len() > expected {
        return Err(error!(
            ErrorKind::IncompleteGrad,
            "tensor {target} received {} gradient edges, expected {expected}",
            partials.len()
        ));
    }
    if partials.len() < expected {
        return Ok(());
    }

    // All edges in: the gradient of `target` is the sum of the partials.
    // A single-edge sum collapses to Identity in the pattern sweep.
    let partials = partials.clone();
    let sum = graph.add_op(
        catalog::SUM,
        Attributes::new(),
        OpSettings::named(format!("grad_sum_{target}")),
    );
    for (index, partial) in partials.iter().enumerate() {
        graph.connect_in(sum, index, partial)?;
    }
    let grad = reserved::grad_id(target);
    graph.create_and_connect_out(sum, 0, &grad)?;
    graph.setup_op(sum)?;
    graph.op_mut(sum)?.from_loss = LossRelation::Yes;

    let target_tensor = graph.tensor(target)?;
    if target_tensor.class == TensorClass::Variable {
        var_updates.push((target.to_string(), grad));
        return Ok(());
    }

    if let Some(producer) = target_tensor.producer {
        let complete = growth.complete_outputs.entry(producer).or_insert(0);
        *complete += 1;
        let needed = growth.on_path_outputs.get(&producer).copied().unwrap_or(0);
        if *complete == needed && !growth.differentiated.contains(&producer) {
            growth.ready.push(producer);
        }
    }
    Ok(())
}
