//! Merge var-updates: group weight updates with identical hyperparameters
//! into one fused update over flattened, concatenated weights and
//! gradients.

use std::collections::BTreeMap;

use tracing::debug;

use crate::attributes::{AttrValue, Attributes};
use crate::error::Result;
use crate::graph::Graph;
use crate::ir::{Ir, MergeVarUpdatePolicy};
use crate::op::{LossRelation, OpId, OpSettings};
use crate::ops::catalog;
use crate::tensor::TensorId;
use crate::transforms::Transform;

pub struct MergeVarUpdates;

impl Transform for MergeVarUpdates {
    fn name(&self) -> &'static str {
        "MergeVarUpdates"
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let policy = ir.options().merge_var_update;
        let threshold = match policy {
            MergeVarUpdatePolicy::None => return Ok(false),
            MergeVarUpdatePolicy::All => i64::MAX,
            MergeVarUpdatePolicy::AutoTight { threshold_bytes } => threshold_bytes.max(1),
        };
        let graph = ir.main_graph_mut();

        // Only the stateless SGD0 update is merged; SGD1 groups would need
        // their momentum state re-sliced.
        let mut groups: BTreeMap<String, Vec<OpId>> = BTreeMap::new();
        for op in graph.ops() {
            if op.operator != catalog::SGD0_VAR_UPDATE {
                continue;
            }
            groups.entry(group_key(graph, op.id)?).or_default().push(op.id);
        }

        let mut changed = false;
        for (key, updates) in groups {
            for bucket in partition(graph, &updates, threshold)? {
                if bucket.len() < 2 {
                    continue;
                }
                debug!(key = key.as_str(), n = bucket.len(), "merging var updates");
                merge_bucket(graph, &bucket)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Updates merge only when every scalar hyperparameter matches: the const
/// compound scalars baked into attributes, and the identities of any
/// streamed non-const scalars.
fn group_key(graph: &Graph, update: OpId) -> Result<String> {
    let op = graph.op(update)?;
    let slr0 = op.attrs.float_or("slr0", f32::NAN)?;
    let wdsf0 = op.attrs.float_or("wdsf0", f32::NAN)?;
    let mut key = format!("slr0:{:08x}/wdsf0:{:08x}", slr0.to_bits(), wdsf0.to_bits());
    for (index, tensor) in op.inputs() {
        if index >= 2 {
            key.push('/');
            key.push_str(tensor);
        }
    }
    Ok(key)
}

/// Splits a group into buckets whose concatenated weight bytes stay under
/// the threshold. A whole group fits in one bucket under policy All.
fn partition(graph: &Graph, updates: &[OpId], threshold: i64) -> Result<Vec<Vec<OpId>>> {
    let mut buckets: Vec<Vec<OpId>> = Vec::new();
    let mut current: Vec<OpId> = Vec::new();
    let mut current_bytes = 0i64;
    for &update in updates {
        let weight = graph.op(update)?.input(0)?.clone();
        let nbytes = graph.tensor_info(&weight)?.nbytes().unwrap_or(0);
        if !current.is_empty() && current_bytes + nbytes > threshold {
            buckets.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(update);
        current_bytes += nbytes;
    }
    if !current.is_empty() {
        buckets.push(current);
    }
    Ok(buckets)
}

fn merge_bucket(graph: &mut Graph, bucket: &[OpId]) -> Result<()> {
    let first = graph.op(bucket[0])?.clone();
    let attrs = first.attrs.clone();
    let scalar_inputs: Vec<(usize, TensorId)> = first
        .inputs()
        .filter(|(index, _)| *index >= 2)
        .map(|(index, tensor)| (index, tensor.clone()))
        .collect();

    let mut weights = Vec::with_capacity(bucket.len());
    let mut grads = Vec::with_capacity(bucket.len());
    for &update in bucket {
        let op = graph.op(update)?;
        weights.push(op.input(0)?.clone());
        grads.push(op.input(1)?.clone());
    }

    let group_tag = bucket[0];
    let flat_weights = flatten_all(graph, &weights, "w", group_tag)?;
    let flat_grads = flatten_all(graph, &grads, "g", group_tag)?;
    let concat_weights = concat_all(graph, &flat_weights, "w", group_tag)?;
    let concat_grads = concat_all(graph, &flat_grads, "g", group_tag)?;

    let merged = graph.add_op(
        catalog::SGD0_VAR_UPDATE,
        attrs,
        OpSettings::named(format!("merged_sgd0_{group_tag}")),
    );
    graph.connect_in(merged, 0, &concat_weights)?;
    graph.connect_in(merged, 1, &concat_grads)?;
    for (index, tensor) in scalar_inputs {
        graph.connect_in(merged, index, &tensor)?;
    }
    graph.create_and_connect_out(merged, 0, &format!("MergedVarUpdate___{group_tag}___updated"))?;
    graph.setup_op(merged)?;
    graph.op_mut(merged)?.from_loss = LossRelation::Yes;

    // Correctness requires the fused update to produce bit-identical
    // weights, which holds because the scalars match exactly; the old
    // per-weight updates and their outputs disappear.
    for &update in bucket {
        let outputs = graph.op(update)?.output_ids();
        graph.topo_cons.transfer(update, merged)?;
        graph.erase_op(update)?;
        for tensor in outputs {
            graph.remove_isolated_tensor(&tensor)?;
        }
    }
    Ok(())
}

fn flatten_all(
    graph: &mut Graph,
    tensors: &[TensorId],
    role: &str,
    group_tag: OpId,
) -> Result<Vec<TensorId>> {
    let mut flattened = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        let op = graph.add_op(
            catalog::FLATTEN_INPLACE,
            Attributes::new().with("axis", AttrValue::Int(0)),
            OpSettings::named(format!("merge_flatten_{role}_{tensor}")),
        );
        graph.connect_in(op, 0, tensor)?;
        let out = format!("MergedVarUpdate___{group_tag}___{tensor}___flat");
        graph.create_and_connect_out(op, 0, &out)?;
        graph.setup_op(op)?;
        graph.op_mut(op)?.from_loss = LossRelation::Yes;
        flattened.push(out);
    }
    Ok(flattened)
}

fn concat_all(
    graph: &mut Graph,
    tensors: &[TensorId],
    role: &str,
    group_tag: OpId,
) -> Result<TensorId> {
    let op = graph.add_op(
        catalog::CONCAT_INPLACE,
        Attributes::new().with("axis", AttrValue::Int(1)),
        OpSettings::named(format!("merge_concat_{role}_{group_tag}")),
    );
    for (index, tensor) in tensors.iter().enumerate() {
        graph.connect_in(op, index, tensor)?;
    }
    let out = format!("MergedVarUpdate___{group_tag}___{role}___concat");
    graph.create_and_connect_out(op, 0, &out)?;
    graph.setup_op(op)?;
    graph.op_mut(op)?.from_loss = LossRelation::Yes;
    Ok(out)
}
