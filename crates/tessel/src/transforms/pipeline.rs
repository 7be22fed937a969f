//! Pipelining: stage assignment, contiguated cross-stage copies, and
//! stash/restore pairs so activations survive until their backward stage.
//!
//! The chosen scheme restores activations in place and runs
//! forward/stash/restore/backward per pipeline cycle, giving a ring-buffer
//! depth of `2*(R - S) + 1` for an activation stashed at stage `S` and
//! restored at stage `R`.

use std::collections::HashMap;

use tracing::debug;

use crate::attributes::{AttrValue, Attributes};
use crate::dataflow::DataFlow;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::ir::{Ir, RecomputationStrategy};
use crate::op::{LossRelation, OpId, OpSettings};
use crate::ops::catalog;
use crate::scheduler;
use crate::tensor::{TensorClass, TensorId, TensorRole};
use crate::transforms::Transform;

pub struct Pipeline;

impl Transform for Pipeline {
    fn name(&self) -> &'static str {
        "Pipeline"
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let training = ir.can_train();
        let full_recompute =
            ir.options().auto_recomputation == RecomputationStrategy::Pipeline;
        let depth = ir.dataflow().batches_per_step()
            * ir.options().replicated_graph_count
            * ir.options().accumulation_factor;
        let dataflow = ir.dataflow().clone();
        let graph = ir.main_graph_mut();

        let max_fwd_stage = assign_pipeline_stages(graph, training)?;

        let min_depth = if training {
            2 * max_fwd_stage + 1
        } else {
            max_fwd_stage + 1
        };
        if depth < min_depth {
            return Err(error!(
                ErrorKind::InsufficientPipelineDepth,
                "pipelining over {} stages needs a depth of at least {min_depth}, got {depth}",
                max_fwd_stage + 1
            ));
        }

        insert_stage_copies(graph)?;
        if training {
            insert_stashes(graph, &dataflow, max_fwd_stage, full_recompute)?;
        }
        Ok(true)
    }
}

/// Gives every op a pipeline stage: forward ops take their virtual-graph
/// id, backward ops mirror it past the loss. Ops without a virtual graph
/// inherit one from their input producers.
fn assign_pipeline_stages(graph: &mut Graph, training: bool) -> Result<i64> {
    // Fill in missing virtual-graph ids from the producing neighborhood.
    for op_id in scheduler::op_schedule(graph)? {
        if graph.op(op_id)?.settings.virtual_graph_id.is_some() {
            continue;
        }
        let mut inherited = None;
        for tensor in graph.op(op_id)?.input_ids() {
            if let Some(producer) = graph.tensor(&tensor)?.producer {
                if let Some(vgid) = graph.op(producer)?.settings.virtual_graph_id {
                    inherited = Some(inherited.map_or(vgid, |v: i64| v.max(vgid)));
                }
            }
        }
        let Some(vgid) = inherited else {
            return Err(error!(
                ErrorKind::InternalLogicError,
                "pipelining requires a virtual-graph id on op {}",
                graph.op(op_id)?.debug_name()
            ));
        };
        graph.op_mut(op_id)?.settings.virtual_graph_id = Some(vgid);
    }

    let mut max_fwd_vgid = 0i64;
    for op in graph.ops() {
        if op.from_loss != LossRelation::Yes {
            if let Some(vgid) = op.settings.virtual_graph_id {
                max_fwd_vgid = max_fwd_vgid.max(vgid);
            }
        }
    }

    for op_id in graph.op_ids() {
        let op = graph.op_mut(op_id)?;
        if op.settings.pipeline_stage.is_some() {
            let stage = op.settings.pipeline_stage.unwrap_or(0);
            if stage < 0 {
                return Err(error!(
                    ErrorKind::InternalLogicError,
                    "op {} has bad pipeline stage {stage}",
                    op.debug_name()
                ));
            }
            continue;
        }
        let vgid = op.settings.virtual_graph_id.unwrap_or(0);
        let stage = if training && op.from_loss == LossRelation::Yes {
            2 * max_fwd_vgid - vgid
        } else {
            vgid
        };
        op.settings.pipeline_stage = Some(stage);
    }

    let mut max_fwd_stage = 0i64;
    for op in graph.ops() {
        if op.from_loss != LossRelation::Yes {
            if let Some(stage) = op.settings.pipeline_stage {
                max_fwd_stage = max_fwd_stage.max(stage);
            }
        }
    }
    Ok(max_fwd_stage)
}

fn stage_of(graph: &Graph, op: OpId) -> Result<i64> {
    graph.op(op)?.settings.pipeline_stage.ok_or_else(|| {
        crate::error::Error::internal(format!("op {op} has no pipeline stage"))
    })
}

/// Inserts a contiguated chain of TileCopy ops for every edge that crosses
/// virtual graphs, so each copy advances exactly one pipeline stage.
fn insert_stage_copies(graph: &mut Graph) -> Result<()> {
    // (source tensor, stage the hop lands on) -> hop output, so fan-outs
    // share one chain instead of duplicating copies.
    let mut hop_cache: HashMap<(TensorId, i64), TensorId> = HashMap::new();

    for op_id in scheduler::op_schedule(graph)? {
        let consumer = graph.op(op_id)?.clone();
        let consumer_stage = stage_of(graph, op_id)?;
        let consumer_vgid = consumer.settings.virtual_graph_id.unwrap_or(0);
        if consumer.operator == catalog::TILE_COPY {
            continue;
        }

        for (index, tensor) in consumer.inputs().map(|(i, t)| (i, t.clone())).collect::<Vec<_>>() {
            let t = graph.tensor(&tensor)?;
            // Producer-less tensors (streams, weights, consts, optimizer
            // scalars) live on their consuming tile.
            let Some(producer) = t.producer else {
                continue;
            };
            let producer_op = graph.op(producer)?;
            let producer_vgid = producer_op.settings.virtual_graph_id.unwrap_or(consumer_vgid);
            if producer_vgid == consumer_vgid {
                continue;
            }
            let producer_stage = stage_of(graph, producer)?;
            let hops = consumer_stage - producer_stage;
            if hops <= 0 {
                return Err(error!(
                    ErrorKind::ConstraintConflict,
                    "edge {tensor} from stage {producer_stage} to {consumer_stage} runs backwards"
                ));
            }
            let producer_loss_markers = (producer_op.path_to_loss, producer_op.from_loss);

            let mut upstream = tensor.clone();
            for hop in 1..=hops {
                let landing = producer_stage + hop;
                let key = (tensor.clone(), landing);
                if let Some(existing) = hop_cache.get(&key) {
                    upstream = existing.clone();
                    continue;
                }
                let hop_vgid = interpolate_vgid(producer_vgid, consumer_vgid, hops, hop);
                let mut settings = OpSettings::named(format!("copy_{tensor}_s{landing}"));
                settings.virtual_graph_id = Some(hop_vgid);
                settings.pipeline_stage = Some(landing - 1);
                let copy = graph.add_op(catalog::TILE_COPY, Attributes::new(), settings);
                graph.connect_in(copy, 0, &upstream)?;
                let out = format!("{tensor}___c{landing}");
                graph.create_and_connect_out(copy, 0, &out)?;
                graph.setup_op(copy)?;
                {
                    let copy_op = graph.op_mut(copy)?;
                    copy_op.path_to_loss = producer_loss_markers.0;
                    copy_op.from_loss = producer_loss_markers.1;
                }
                hop_cache.insert(key, out.clone());
                upstream = out;
            }

            graph.disconnect_in(op_id, index)?;
            graph.connect_in(op_id, index, &upstream)?;
            debug!(
                tensor = tensor.as_str(),
                hops, "contiguated cross-stage edge"
            );
        }
    }
    Ok(())
}

fn interpolate_vgid(from: i64, to: i64, hops: i64, hop: i64) -> i64 {
    if hops > 0 && (to - from) % hops == 0 {
        from + hop * (to - from) / hops
    } else {
        to
    }
}

/// For every activation produced in stage `S` and consumed on the same
/// virtual graph in a later stage `R`, inserts a Stash of depth
/// `2*(R-S)+1` at `S` and a paired Restore at `R`, rewiring the backward
/// consumers onto the restored value.
fn insert_stashes(
    graph: &mut Graph,
    dataflow: &DataFlow,
    max_fwd_stage: i64,
    full_recompute: bool,
) -> Result<()> {
    let tensor_ids = graph.tensors.ids();
    for tensor_id in tensor_ids {
        let tensor = graph.tensor(&tensor_id)?;
        if tensor.consumers.is_empty() {
            continue;
        }
        match tensor.class {
            TensorClass::Variable | TensorClass::Const | TensorClass::Momentum => continue,
            _ => {}
        }
        if tensor.role() != TensorRole::Default {
            continue;
        }

        let producer = tensor.producer;
        let produced_by_copy = match producer {
            Some(p) => graph.op(p)?.operator == catalog::TILE_COPY,
            None => true,
        };
        // Under full recomputation a stage rebuilds its own activations;
        // only tensors entering the stage from outside are stashed.
        if full_recompute && !produced_by_copy {
            continue;
        }

        let stash_stage = match producer {
            Some(p) if !produced_by_copy => stage_of(graph, p)?,
            Some(p) => stage_of(graph, p)? + 1,
            None => {
                let mut lowest = None;
                for consumer in graph.tensor(&tensor_id)?.consumers.ops() {
                    let stage = stage_of(graph, consumer)?;
                    lowest = Some(lowest.map_or(stage, |l: i64| std::cmp::min(l, stage)));
                }
                match lowest {
                    Some(stage) => stage,
                    None => continue,
                }
            }
        };

        // The forward output of the final stage feeds the backward pass
        // directly; no ring buffer needed.
        if stash_stage >= max_fwd_stage {
            continue;
        }

        let mut restore_stage = None;
        let mut copy_consumer = false;
        for consumer in graph.tensor(&tensor_id)?.consumers.ops() {
            let consumer_op = graph.op(consumer)?;
            if consumer_op.operator == catalog::TILE_COPY {
                copy_consumer = true;
                continue;
            }
            let stage = stage_of(graph, consumer)?;
            if stage > stash_stage {
                restore_stage = Some(restore_stage.map_or(stage, |r: i64| std::cmp::max(r, stage)));
            }
        }
        // Tensors used only within one stage are not stashed.
        let Some(restore_stage) = restore_stage else {
            continue;
        };

        let vgid = match producer {
            Some(p) => graph.op(p)?.settings.virtual_graph_id,
            None => graph
                .tensor(&tensor_id)?
                .consumers
                .ops()
                .first()
                .and_then(|&c| graph.op(c).ok())
                .and_then(|op| op.settings.virtual_graph_id),
        };

        let stash_size = 2 * (restore_stage - stash_stage) + 1;
        debug!(
            tensor = tensor_id.as_str(),
            stash_stage, restore_stage, stash_size, "stashing activation"
        );

        let mut stash_settings = OpSettings::named(format!("stash_{tensor_id}"));
        stash_settings.virtual_graph_id = vgid;
        stash_settings.pipeline_stage = Some(stash_stage);
        let stash = graph.add_op(
            catalog::STASH,
            Attributes::new().with("stash_size", AttrValue::Int(stash_size)),
            stash_settings,
        );
        graph.connect_in(stash, 0, &tensor_id)?;
        let stash_tensor = format!("Stash___{tensor_id}");
        graph.create_and_connect_out(stash, 0, &stash_tensor)?;
        graph.setup_op(stash)?;

        // In-place restore unless the host or another tile still needs the
        // original buffer. Host-fed buffers are never mutated.
        let is_inplace = !dataflow.is_anchored(&tensor_id)
            && !copy_consumer
            && graph.tensor(&tensor_id)?.class == TensorClass::ActGrad;
        let restore_operator = if is_inplace {
            catalog::RESTORE_INPLACE
        } else {
            catalog::RESTORE
        };
        let mut restore_settings = OpSettings::named(format!("restore_{tensor_id}"));
        restore_settings.virtual_graph_id = vgid;
        restore_settings.pipeline_stage = Some(restore_stage);
        let restore = graph.add_op(
            restore_operator,
            Attributes::new().with("stash_size", AttrValue::Int(stash_size)),
            restore_settings,
        );
        graph.connect_in(restore, 0, &tensor_id)?;
        graph.connect_in(restore, 1, &stash_tensor)?;
        let restored = format!("{tensor_id}___restored");
        graph.create_and_connect_out(restore, 0, &restored)?;
        graph.setup_op(restore)?;
        graph.op_mut(restore)?.from_loss = LossRelation::Yes;

        // Consumers in the restore stage read the restored value; anything
        // in between still sees the original, which the ring buffer keeps
        // alive until the restore.
        let consumers = graph.tensor(&tensor_id)?.consumers.ops();
        for consumer in consumers {
            if consumer == stash || consumer == restore {
                continue;
            }
            if stage_of(graph, consumer)? == restore_stage {
                graph.replace_input(consumer, &tensor_id, &restored)?;
            }
        }

        // The stash must run before everything else that reads or mutates
        // the activation, the in-place restore included.
        let consumers = graph.tensor(&tensor_id)?.consumers.ops();
        for consumer in consumers {
            if consumer != stash {
                graph.topo_cons.insert(stash, consumer)?;
            }
        }
    }
    Ok(())
}
