//! The alias/inplace tier: swap ops for their inplace variants where the
//! mutation cannot be observed.

use std::collections::HashSet;

use tracing::debug;

use crate::dataflow::DataFlow;
use crate::error::Result;
use crate::graph::Graph;
use crate::op::OpId;
use crate::ops::{self, InplaceVariant};
use crate::patterns::replace_op;
use crate::scheduler;
use crate::tensor::TensorClass;

/// Chooses inplace variants by descending priority while honoring
/// modified/aliased regions, anchors and existing constraints. Returns
/// whether any op was replaced.
pub fn apply_inplace(graph: &mut Graph, dataflow: &DataFlow) -> Result<bool> {
    let mut changed = false;
    for candidate in scheduler::op_schedule(graph)? {
        if !graph.has_op(candidate) {
            continue;
        }
        let op = graph.op(candidate)?;
        let def = ops::opdef(&op.operator)?;
        let Some(variants_fn) = def.inplace_variants else {
            continue;
        };
        let mut variants: Vec<InplaceVariant> = variants_fn(op);
        variants.retain(|v| v.priority > 0.0);
        variants.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        for variant in variants {
            match try_variant(graph, candidate, &variant, dataflow)? {
                Some(new_op) => {
                    debug!(
                        op = candidate,
                        replacement = new_op,
                        variant = variant.operator.name,
                        "inplaced"
                    );
                    changed = true;
                    break;
                }
                // Outplace retry discipline: the next-priority variant, or
                // leaving the op outplace, is the fallback.
                None => continue,
            }
        }
    }
    Ok(changed)
}

/// Attempts one variant; returns the replacement op id if legal.
fn try_variant(
    graph: &mut Graph,
    candidate: OpId,
    variant: &InplaceVariant,
    dataflow: &DataFlow,
) -> Result<Option<OpId>> {
    let variant_def = ops::opdef(&variant.operator)?;
    let op = graph.op(candidate)?.clone();

    let mut wanted_constraints: Vec<(OpId, OpId)> = Vec::new();
    for &in_index in variant_def.modifies {
        let Ok(tensor_id) = op.input(in_index) else {
            return Ok(None);
        };
        let tensor = graph.tensor(tensor_id)?;
        // The host must observe anchored values unmutated, and persistent
        // or host-fed tensors keep their buffers intact.
        if dataflow.is_anchored(tensor_id) || tensor.class != TensorClass::ActGrad {
            return Ok(None);
        }
        for consumer in tensor.consumers.ops() {
            if consumer == candidate {
                continue;
            }
            if reaches(graph, candidate, consumer)? {
                // The consumer would read the mutated value.
                return Ok(None);
            }
            wanted_constraints.push((consumer, candidate));
        }
    }

    let attrs = op.attrs.clone();
    let inputs = op.input_ids();
    let new_op = replace_op(graph, candidate, variant.operator.clone(), attrs, &inputs)?;
    for (before, after) in wanted_constraints {
        let after = if after == candidate { new_op } else { after };
        graph.topo_cons.insert(before, after)?;
    }
    Ok(Some(new_op))
}

/// Whether `to` is reachable from `from` along dataflow or constraint
/// edges.
fn reaches(graph: &Graph, from: OpId, to: OpId) -> Result<bool> {
    let mut frontier = vec![from];
    let mut seen: HashSet<OpId> = HashSet::new();
    while let Some(op) = frontier.pop() {
        if op == to {
            return Ok(true);
        }
        if !seen.insert(op) {
            continue;
        }
        let op_ref = graph.op(op)?;
        for (_, tensor) in op_ref.outputs() {
            for consumer in graph.tensor(tensor)?.consumers.ops() {
                frontier.push(consumer);
            }
        }
        for after in graph.topo_cons.afters(op) {
            frontier.push(after);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;
    use crate::dtype::DType;
    use crate::graph::{OpIdCounter, MAIN_GRAPH};
    use crate::op::OpSettings;
    use crate::ops::catalog;
    use crate::shape::TensorInfo;

    #[test]
    fn relu_inplaces_when_the_input_is_dead_afterwards() {
        crate::ops::register_builtin_ops();
        let mut g = Graph::new(MAIN_GRAPH, None, OpIdCounter::default());
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![4]))
            .unwrap();
        let square = g.add_op(catalog::SQUARE, Attributes::new(), OpSettings::default());
        g.connect_in(square, 0, "x").unwrap();
        g.create_and_connect_out(square, 0, "sq").unwrap();
        g.setup_op(square).unwrap();
        let relu = g.add_op(catalog::RELU, Attributes::new(), OpSettings::default());
        g.connect_in(relu, 0, "sq").unwrap();
        g.create_and_connect_out(relu, 0, "act").unwrap();
        g.setup_op(relu).unwrap();

        let flow = DataFlow::default();
        assert!(apply_inplace(&mut g, &flow).unwrap());
        let producer = g.tensor("act").unwrap().producer().unwrap();
        assert_eq!(g.op(producer).unwrap().operator, catalog::RELU_INPLACE);
        g.verify().unwrap();
    }

    #[test]
    fn anchored_tensors_stay_outplace() {
        crate::ops::register_builtin_ops();
        let mut g = Graph::new(MAIN_GRAPH, None, OpIdCounter::default());
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![4]))
            .unwrap();
        let square = g.add_op(catalog::SQUARE, Attributes::new(), OpSettings::default());
        g.connect_in(square, 0, "x").unwrap();
        g.create_and_connect_out(square, 0, "sq").unwrap();
        g.setup_op(square).unwrap();
        let relu = g.add_op(catalog::RELU, Attributes::new(), OpSettings::default());
        g.connect_in(relu, 0, "sq").unwrap();
        g.create_and_connect_out(relu, 0, "act").unwrap();
        g.setup_op(relu).unwrap();

        let flow = DataFlow::new(
            1,
            [("sq".to_string(), crate::dataflow::AnchorReturnType::All)],
        )
        .unwrap();
        assert!(!apply_inplace(&mut g, &flow).unwrap());
        let producer = g.tensor("act").unwrap().producer().unwrap();
        assert_eq!(g.op(producer).unwrap().operator, catalog::RELU);
    }
}
