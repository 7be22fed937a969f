//! Pruning: erase every op not needed for an anchor or a training target.

use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::ir::Ir;
use crate::op::OpId;
use crate::ops;
use crate::tensor::TensorId;
use crate::transforms::Transform;

pub struct Prune;

impl Transform for Prune {
    fn name(&self) -> &'static str {
        "Prune"
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let anchors = ir.dataflow().anchors();
        let graph = ir.main_graph_mut();

        // The required set starts as the training targets: var updates and
        // the declared loss ops.
        let mut required: HashSet<OpId> = HashSet::new();
        for op in graph.ops() {
            let def = ops::opdef(&op.operator)?;
            if def.flags.var_update || def.flags.loss {
                required.insert(op.id);
            }
        }

        // The walk front holds tensors known to be needed: anchors plus
        // the inputs of every required op.
        let mut front: Vec<TensorId> = Vec::new();
        let mut visited: HashSet<TensorId> = HashSet::new();
        for id in anchors {
            if graph.tensors.contains(&id) && visited.insert(id.clone()) {
                front.push(id);
            }
        }
        for &op in &required {
            for tensor in graph.op(op)?.input_ids() {
                if visited.insert(tensor.clone()) {
                    front.push(tensor);
                }
            }
        }

        while let Some(tensor_id) = front.pop() {
            let tensor = graph.tensor(&tensor_id)?;
            let mut newly_required: Vec<OpId> = Vec::new();
            // A consumer that modifies a needed tensor in place is itself
            // needed.
            for consumer in tensor.consumers.ops() {
                let op = graph.op(consumer)?;
                let def = ops::opdef(&op.operator)?;
                if op
                    .input_indices(&tensor_id)
                    .iter()
                    .any(|&index| def.modifies(index))
                {
                    newly_required.push(consumer);
                }
            }
            if let Some(producer) = tensor.producer {
                newly_required.push(producer);
            }
            for op in newly_required {
                if required.insert(op) {
                    for input in graph.op(op)?.input_ids() {
                        if visited.insert(input.clone()) {
                            front.push(input);
                        }
                    }
                }
            }
        }

        let mut ops_to_delete: Vec<OpId> = Vec::new();
        let mut tensors_to_delete: Vec<TensorId> = Vec::new();
        for op in graph.ops() {
            if !required.contains(&op.id) {
                ops_to_delete.push(op.id);
                tensors_to_delete.extend(op.output_ids());
            }
        }

        let changed = !ops_to_delete.is_empty();
        for op in &ops_to_delete {
            graph.erase_op(*op)?;
        }
        for tensor in &tensors_to_delete {
            graph.remove_isolated_tensor(tensor)?;
        }
        if changed {
            debug!(
                ops = ops_to_delete.len(),
                tensors = tensors_to_delete.len(),
                "pruned unreachable graph"
            );
        }
        Ok(changed)
    }
}
