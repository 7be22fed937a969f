//! Batch serialization: run each batched op as `factor` copies over batch
//! slices (pass 1), then crystallize a repeating schedule across the
//! phases with topological constraints (pass 2).

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::attributes::{AttrValue, Attributes};
use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::ir::Ir;
use crate::op::{Op, OpId, OpSettings};
use crate::ops::{self, catalog};
use crate::scheduler;
use crate::shape::TensorInfo;
use crate::tensor::{TensorClass, TensorId, TensorRole};
use crate::transforms::Transform;

pub struct BatchSerialize {
    pass: u8,
}

impl BatchSerialize {
    pub fn pass1() -> Self {
        BatchSerialize { pass: 1 }
    }

    pub fn pass2() -> Self {
        BatchSerialize { pass: 2 }
    }
}

impl Transform for BatchSerialize {
    fn name(&self) -> &'static str {
        match self.pass {
            1 => "BatchSerialize(1)",
            _ => "BatchSerialize(2)",
        }
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let factor = ir.options().batch_serialization_factor;
        if factor <= 1 {
            return Ok(false);
        }
        let dynamic = ir.options().batch_serialization_dynamic;
        let anchors: HashSet<TensorId> = ir.dataflow().anchors().into_iter().collect();
        let graph = ir.main_graph_mut();
        match self.pass {
            1 => shard(graph, factor, dynamic, &anchors),
            _ => crystallize(graph, factor),
        }
    }
}

/// Pass 1: split every shardable op with a batched input into `factor`
/// copies over batch slices, concatenating only where a downstream
/// consumer still needs the whole tensor.
fn shard(
    graph: &mut Graph,
    factor: i64,
    dynamic: bool,
    anchors: &HashSet<TensorId>,
) -> Result<bool> {
    // Tensors carrying a batch axis (axis 0): host streams seed the set.
    let mut has_batch: HashSet<TensorId> = HashSet::new();
    for tensor in graph.tensors.iter() {
        if tensor.class == TensorClass::Stream
            && tensor.role() == TensorRole::Default
            && tensor.info().map(|i| i.rank() > 0).unwrap_or(false)
        {
            has_batch.insert(tensor.id.clone());
        }
    }

    let mut serialized: HashMap<TensorId, Vec<TensorId>> = HashMap::new();
    let mut slice_cache: HashMap<(TensorId, i64), TensorId> = HashMap::new();
    let mut changed = false;

    for op_id in scheduler::op_schedule(graph)? {
        if !graph.has_op(op_id) {
            continue;
        }
        let op = graph.op(op_id)?.clone();
        let def = ops::opdef(&op.operator)?;

        let batched: Vec<(usize, TensorId)> = op
            .inputs()
            .filter(|(_, t)| serialized.contains_key(*t) || has_batch.contains(*t))
            .map(|(i, t)| (i, t.clone()))
            .collect();
        if batched.is_empty() {
            continue;
        }
        if !def.flags.shardable {
            // Left whole; the final sweep materializes any concats this op
            // needs.
            continue;
        }

        // Every batched input must agree on the batch extent.
        let mut batch_extent: Option<i64> = None;
        for (_, tensor) in &batched {
            let extent = graph.tensor_info(tensor)?.dim(0);
            match batch_extent {
                None => batch_extent = Some(extent),
                Some(existing) if existing != extent => {
                    return Err(error!(
                        ErrorKind::BatchAxisAmbiguous,
                        "op {} mixes batch extents {existing} and {extent}",
                        op.debug_name()
                    ));
                }
                Some(_) => {}
            }
        }
        let batch = batch_extent.unwrap_or(0);
        if batch % factor != 0 {
            return Err(error!(
                ErrorKind::UnshardableOp,
                "op {} has batch extent {batch}, not divisible by factor {factor}",
                op.debug_name()
            ));
        }
        let chunk = batch / factor;

        debug!(op = op.debug_name().as_str(), factor, "batch-serializing op");
        let mut phase_outputs: HashMap<TensorId, Vec<TensorId>> = HashMap::new();
        for phase in 0..factor {
            let mut copy = graph.clone_op(op_id)?;
            copy.settings.name = format!("{}_bsp{phase}", op.settings.name);
            copy.settings.batch_serialized_phase = Some(phase);
            let copy_id = graph.move_into_graph(copy);

            for (index, tensor) in op.inputs() {
                let source = if let Some(phases) = serialized.get(tensor) {
                    phases[phase as usize].clone()
                } else if has_batch.contains(tensor) {
                    sliced_phase(
                        graph,
                        &mut slice_cache,
                        tensor,
                        phase,
                        chunk,
                        dynamic,
                        &op,
                    )?
                } else {
                    tensor.clone()
                };
                graph.connect_in(copy_id, index, &source)?;
            }
            for (index, tensor) in op.outputs() {
                let out = format!("{tensor}___phase{phase}");
                graph.create_and_connect_out(copy_id, index, &out)?;
                phase_outputs.entry(tensor.clone()).or_default().push(out);
            }
            graph.setup_op(copy_id)?;
            let markers = (op.path_to_loss, op.from_loss);
            let copy_op = graph.op_mut(copy_id)?;
            copy_op.path_to_loss = markers.0;
            copy_op.from_loss = markers.1;
        }

        graph.erase_op(op_id)?;
        for (tensor, phases) in phase_outputs {
            serialized.insert(tensor, phases);
        }
        changed = true;
    }

    // Whole-tensor consumers (including anchors) get a concat; fully
    // sharded tensors disappear.
    let keys: Vec<TensorId> = serialized.keys().cloned().collect();
    for tensor in keys {
        let needed = anchors.contains(&tensor)
            || graph.tensor(&tensor)?.consumers.total() > 0;
        let phases = serialized[&tensor].clone();
        if needed {
            let first_producer = graph.tensor(&phases[0])?.producer()?;
            let settings = {
                let producer = graph.op(first_producer)?;
                let mut settings = OpSettings::named(format!("concat_{tensor}"));
                settings.virtual_graph_id = producer.settings.virtual_graph_id;
                settings.pipeline_stage = producer.settings.pipeline_stage;
                settings
            };
            let concat = graph.add_op(
                catalog::CONCAT,
                Attributes::new().with("axis", AttrValue::Int(0)),
                settings,
            );
            for (index, phase_tensor) in phases.iter().enumerate() {
                graph.connect_in(concat, index, phase_tensor)?;
            }
            graph.connect_out(concat, 0, &tensor)?;
            graph.setup_op(concat)?;
        } else {
            graph.remove_isolated_tensor(&tensor)?;
        }
    }
    Ok(changed)
}

/// The slice feeding one phase of a batched tensor, created on first use
/// and shared by every consumer in that phase.
fn sliced_phase(
    graph: &mut Graph,
    cache: &mut HashMap<(TensorId, i64), TensorId>,
    tensor: &str,
    phase: i64,
    chunk: i64,
    dynamic: bool,
    consumer: &Op,
) -> Result<TensorId> {
    let key = (tensor.to_string(), phase);
    if let Some(existing) = cache.get(&key) {
        return Ok(existing.clone());
    }
    let mut settings = OpSettings::named(format!("{tensor}_bslice{phase}"));
    settings.virtual_graph_id = consumer.settings.virtual_graph_id;
    settings.pipeline_stage = consumer.settings.pipeline_stage;
    settings.batch_serialized_phase = Some(phase);

    let out = format!("{tensor}___bs{phase}");
    let slice = if dynamic {
        let index_tensor = phase_index_tensor(graph, phase)?;
        let slice = graph.add_op(
            catalog::DYNAMIC_SLICE,
            Attributes::new()
                .with("axes", AttrValue::Ints(vec![0]))
                .with("sizes", AttrValue::Ints(vec![chunk])),
            settings,
        );
        graph.connect_in(slice, 0, tensor)?;
        graph.connect_in(slice, 1, &index_tensor)?;
        slice
    } else {
        let slice = graph.add_op(
            catalog::SLICE,
            Attributes::new()
                .with("axes", AttrValue::Ints(vec![0]))
                .with("starts", AttrValue::Ints(vec![phase * chunk]))
                .with("ends", AttrValue::Ints(vec![(phase + 1) * chunk])),
            settings,
        );
        graph.connect_in(slice, 0, tensor)?;
        slice
    };
    graph.create_and_connect_out(slice, 0, &out)?;
    graph.setup_op(slice)?;
    let markers = (consumer.path_to_loss, consumer.from_loss);
    let slice_op = graph.op_mut(slice)?;
    slice_op.path_to_loss = markers.0;
    slice_op.from_loss = markers.1;
    cache.insert(key, out.clone());
    Ok(out)
}

/// The Const index tensor naming one batch-serialized phase.
fn phase_index_tensor(graph: &mut Graph, phase: i64) -> Result<TensorId> {
    let id = format!("BsIndex___{phase}");
    if !graph.tensors.contains(&id) {
        graph.tensors.add_const_init(
            id.clone(),
            TensorInfo::new(DType::Uint32, vec![1]),
            (phase as u32).to_le_bytes().to_vec(),
        )?;
    }
    Ok(id)
}

/// Pass 2: find the isomorphic op of each phase-0 op in every later phase
/// by bounded local-subgraph comparison and constrain phase `k+1` to run
/// after phase `k`.
fn crystallize(graph: &mut Graph, factor: i64) -> Result<bool> {
    let schedule = scheduler::op_schedule(graph)?;
    let mut by_phase: HashMap<i64, Vec<OpId>> = HashMap::new();
    for &op_id in &schedule {
        if let Some(phase) = graph.op(op_id)?.settings.batch_serialized_phase {
            by_phase.entry(phase).or_default().push(op_id);
        }
    }

    let mut used: HashSet<OpId> = HashSet::new();
    let mut changed = false;
    for &op0 in by_phase.get(&0).unwrap_or(&Vec::new()) {
        let mut chain = vec![op0];
        for phase in 1..factor {
            let mut best: Option<(i64, OpId)> = None;
            for &candidate in by_phase.get(&phase).unwrap_or(&Vec::new()) {
                if used.contains(&candidate) {
                    continue;
                }
                if !labels_match(graph, op0, candidate)? {
                    continue;
                }
                let score = iso_score(graph, op0, candidate, 5)?;
                if score == 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_score, best_op)) => {
                        score > best_score || (score == best_score && candidate < best_op)
                    }
                };
                if better {
                    best = Some((score, candidate));
                }
            }
            if let Some((_, found)) = best {
                chain.push(found);
            }
        }
        if chain.len() == factor as usize {
            for window in chain.windows(2) {
                graph.topo_cons.insert(window[0], window[1])?;
                changed = true;
            }
            used.extend(chain.iter().copied());
        } else {
            debug!(
                op = op0,
                found = chain.len(),
                "no isomorphic counterpart in every phase"
            );
        }
    }
    Ok(changed)
}

/// Candidates must agree on the loss-relative position and pipeline stage.
fn labels_match(graph: &Graph, a: OpId, b: OpId) -> Result<bool> {
    let op_a = graph.op(a)?;
    let op_b = graph.op(b)?;
    Ok(op_a.operator == op_b.operator
        && op_a.from_loss == op_b.from_loss
        && op_a.settings.pipeline_stage == op_b.settings.pipeline_stage)
}

/// Structural similarity of the local producer subgraphs, bounded by
/// `depth`.
fn iso_score(graph: &Graph, a: OpId, b: OpId, depth: usize) -> Result<i64> {
    let op_a = graph.op(a)?;
    let op_b = graph.op(b)?;
    if op_a.operator != op_b.operator {
        return Ok(0);
    }
    let mut score = 1;
    if depth == 0 {
        return Ok(score);
    }
    for index in 0..op_a.n_inputs().min(op_b.n_inputs()) {
        let (Ok(in_a), Ok(in_b)) = (op_a.input(index), op_b.input(index)) else {
            continue;
        };
        let producer_a = graph.tensor(in_a)?.producer;
        let producer_b = graph.tensor(in_b)?.producer;
        if let (Some(pa), Some(pb)) = (producer_a, producer_b) {
            score += iso_score(graph, pa, pb, depth - 1)?;
        }
    }
    Ok(score)
}
