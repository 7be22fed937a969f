//! Recomputation: choose checkpoints, tag the rest RECOMPUTE, and grow
//! shadow clones for the backward pass on demand.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::error::Result;
use crate::graph::Graph;
use crate::ir::{Ir, RecomputationStrategy};
use crate::op::{LossRelation, OpId, RecomputeKind};
use crate::ops;
use crate::scheduler;
use crate::tensor::{reserved, TensorId};
use crate::transforms::Transform;

pub struct RecomputeTag;

impl Transform for RecomputeTag {
    fn name(&self) -> &'static str {
        "Recompute"
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let strategy = ir.options().auto_recomputation;
        let graph = ir.main_graph_mut();

        let fwd_ops: Vec<OpId> = forward_schedule(graph)?;
        if fwd_ops.is_empty() {
            return Ok(false);
        }

        // User annotations win: if any forward op was tagged by hand, the
        // automatic strategies stay out of the way.
        if fwd_ops.iter().any(|&id| {
            graph
                .op(id)
                .map(|op| op.settings.recompute != RecomputeKind::Undefined)
                .unwrap_or(false)
        }) {
            info!("recomputation uses user annotations");
            for &id in &fwd_ops {
                let op = graph.op_mut(id)?;
                if op.settings.recompute == RecomputeKind::Undefined {
                    op.settings.recompute = RecomputeKind::Checkpoint;
                }
            }
            return Ok(true);
        }

        match strategy {
            RecomputationStrategy::Standard => {
                info!("recomputation uses the Standard interval strategy");
                let checkpoints = standard_checkpoints(graph, &fwd_ops)?;
                for &id in &fwd_ops {
                    let kind = if checkpoints.contains(&id) {
                        RecomputeKind::Checkpoint
                    } else {
                        RecomputeKind::Recompute
                    };
                    graph.op_mut(id)?.settings.recompute = kind;
                }
            }
            RecomputationStrategy::NormOnly => {
                info!("recomputation uses the NormOnly strategy");
                let mut prev_was_norm = false;
                for &id in &fwd_ops {
                    let flags = ops::opdef(&graph.op(id)?.operator)?.flags;
                    let op = graph.op_mut(id)?;
                    if flags.norm {
                        op.settings.recompute = RecomputeKind::Recompute;
                        prev_was_norm = true;
                    } else if prev_was_norm && flags.elementwise_unary {
                        op.settings.recompute = RecomputeKind::Recompute;
                    } else {
                        op.settings.recompute = RecomputeKind::Checkpoint;
                        prev_was_norm = false;
                    }
                }
            }
            RecomputationStrategy::None | RecomputationStrategy::Pipeline => {
                // Pipeline-time recomputation is decided by the pipelining
                // transform, which knows the stage boundaries.
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Forward ops in schedule order: on a path to the loss but not grown from
/// it.
fn forward_schedule(graph: &Graph) -> Result<Vec<OpId>> {
    Ok(scheduler::op_schedule(graph)?
        .into_iter()
        .filter(|&id| {
            graph
                .op(id)
                .map(|op| {
                    op.path_to_loss == LossRelation::Yes && op.from_loss == LossRelation::No
                })
                .unwrap_or(false)
        })
        .collect())
}

/// Standard strategy: partition the forward schedule into decreasing-length
/// intervals and checkpoint the minimum-output-memory live set of each.
fn standard_checkpoints(graph: &Graph, fwd_ops: &[OpId]) -> Result<HashSet<OpId>> {
    let live_sets = scheduler::live_sets(graph, fwd_ops)?;
    let mut memory_of_lives = Vec::with_capacity(live_sets.len());
    for live in &live_sets {
        let mut memory = 0i64;
        for &op in live {
            memory += output_bytes(graph, op)?;
        }
        memory_of_lives.push(memory);
    }

    let mut checkpoints = HashSet::new();
    for (begin, end) in decreasing_intervals(fwd_ops.len()) {
        let mut lowest = i64::MAX;
        let mut best: Option<usize> = None;
        for position in begin..end {
            if memory_of_lives[position] < lowest {
                lowest = memory_of_lives[position];
                best = Some(position);
            }
        }
        if let Some(position) = best {
            checkpoints.extend(live_sets[position].iter().copied());
        }
    }
    Ok(checkpoints)
}

fn output_bytes(graph: &Graph, op: OpId) -> Result<i64> {
    let mut total = 0i64;
    for (_, tensor) in graph.op(op)?.outputs() {
        total += graph.tensor_info(tensor)?.nbytes().unwrap_or(0);
    }
    Ok(total)
}

/// Intervals of decreasing length covering `[0, n)`: the first interval is
/// the longest, the last has length one.
fn decreasing_intervals(n: usize) -> Vec<(usize, usize)> {
    let mut length = 1usize;
    while length * (length + 1) / 2 < n {
        length += 1;
    }
    let mut intervals = Vec::new();
    let mut begin = 0usize;
    while begin < n {
        let end = (begin + length).min(n);
        intervals.push((begin, end));
        begin = end;
        length = length.saturating_sub(1).max(1);
    }
    intervals
}

/// Materializes the shadow copy of every RECOMPUTE-tagged op whose output
/// feeds the backward pass: the clone runs as late as possible and the
/// backward consumers read the recomputed tensors.
pub fn grow_recompute_clones(graph: &mut Graph) -> Result<usize> {
    let schedule = scheduler::op_schedule(graph)?;
    let mut recompute_of: HashMap<TensorId, TensorId> = HashMap::new();
    let mut grown = 0usize;

    for op_id in schedule {
        let op = graph.op(op_id)?.clone();
        if op.settings.recompute != RecomputeKind::Recompute
            || op.from_loss != LossRelation::No
        {
            continue;
        }
        // Only shadow ops whose outputs are actually read by the backward
        // pass.
        let mut backward_consumers: Vec<(OpId, TensorId)> = Vec::new();
        for (_, tensor) in op.outputs() {
            for consumer in graph.tensor(tensor)?.consumers.ops() {
                if graph.op(consumer)?.from_loss == LossRelation::Yes {
                    backward_consumers.push((consumer, tensor.clone()));
                }
            }
        }
        if backward_consumers.is_empty() {
            continue;
        }

        let clone = graph.clone_op(op_id)?;
        let clone_id = graph.move_into_graph(clone);
        for (index, tensor) in op.inputs() {
            // Inputs produced by an already-shadowed op are read from the
            // recomputed copies.
            let source = recompute_of.get(tensor).cloned().unwrap_or_else(|| tensor.clone());
            graph.connect_in(clone_id, index, &source)?;
        }
        for (index, tensor) in op.outputs() {
            let recomputed = reserved::recompute_id(tensor);
            graph.create_and_connect_out(clone_id, index, &recomputed)?;
            recompute_of.insert(tensor.clone(), recomputed);
        }
        graph.setup_op(clone_id)?;
        {
            let clone_op = graph.op_mut(clone_id)?;
            // Run as late as the scheduler allows.
            clone_op.settings.priority = f64::MIN;
            clone_op.from_loss = LossRelation::No;
            clone_op.path_to_loss = LossRelation::Yes;
        }

        for (consumer, tensor) in backward_consumers {
            let recomputed = recompute_of[&tensor].clone();
            graph.replace_input(consumer, &tensor, &recomputed)?;
        }
        grown += 1;
        debug!(op = op.debug_name().as_str(), "grew recompute clone");
    }
    Ok(grown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_cover_and_decrease() {
        for n in 1..40 {
            let intervals = decreasing_intervals(n);
            assert_eq!(intervals.first().map(|i| i.0), Some(0));
            assert_eq!(intervals.last().map(|i| i.1), Some(n));
            for window in intervals.windows(2) {
                assert_eq!(window[0].1, window[1].0);
                assert!(window[1].1 - window[1].0 <= window[0].1 - window[0].0);
            }
        }
    }
}
