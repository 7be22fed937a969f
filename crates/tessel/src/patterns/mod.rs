//! Local peephole rewrites driven by a matches/touches/apply contract.

mod inplace;
mod prealias;
mod softmax_grad_direct;

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::op::{Op, OpId, OpSettings, OperatorId};
use crate::tensor::TensorId;

pub use inplace::apply_inplace;
pub use prealias::{NegSubToSubSwap, OpToIdentity, PreUniRepl};
pub use softmax_grad_direct::SoftmaxGradDirect;

/// One peephole rewrite. `matches` inspects a bounded neighborhood of the
/// candidate; `touches` names every tensor `apply` will change so the
/// driver can detect mutually exclusive rewrites; `apply` must leave the
/// graph consistent and returns whether it fired.
pub trait Pattern {
    fn name(&self) -> &'static str;
    fn matches(&self, op: &Op, graph: &Graph) -> Result<bool>;
    fn touches(&self, op: &Op, graph: &Graph) -> Result<Vec<TensorId>>;
    fn apply(&self, op: OpId, graph: &mut Graph) -> Result<bool>;
}

/// Enablement level of the registered pattern set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternsLevel {
    None,
    #[default]
    Default,
    All,
}

/// Pattern configuration: which pre-alias patterns run, and whether the
/// inplace tier runs. Patterns fire in registration (priority) order.
pub struct Patterns {
    enabled: BTreeMap<&'static str, bool>,
    inplace_enabled: bool,
}

impl Default for Patterns {
    fn default() -> Self {
        Patterns::new(PatternsLevel::Default)
    }
}

impl Patterns {
    pub fn new(level: PatternsLevel) -> Self {
        let mut enabled = BTreeMap::new();
        let on = level != PatternsLevel::None;
        for pattern in pre_alias_list() {
            enabled.insert(pattern.name(), on);
        }
        Patterns {
            enabled,
            inplace_enabled: on,
        }
    }

    pub fn enable(&mut self, name: &str, value: bool) -> Result<()> {
        match self.enabled.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(error!(ErrorKind::UnknownAttribute, "unknown pattern {name}")),
        }
    }

    pub fn enable_inplace(&mut self, value: bool) {
        self.inplace_enabled = value;
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.get(name).copied().unwrap_or(false)
    }

    pub fn inplace_enabled(&self) -> bool {
        self.inplace_enabled
    }

    /// Runs the enabled pre-alias patterns to quiescence. Returns whether
    /// anything fired.
    pub fn apply_pre_alias(&self, graph: &mut Graph) -> Result<bool> {
        let patterns: Vec<Box<dyn Pattern>> = pre_alias_list()
            .into_iter()
            .filter(|p| self.is_enabled(p.name()))
            .collect();
        if patterns.is_empty() {
            return Ok(false);
        }

        let mut any_fired = false;
        // Each round drains a queue seeded with every op; neighbors of a
        // rewrite re-queue within the round. Quiescence is a full round in
        // which nothing fires.
        loop {
            let mut queue: VecDeque<OpId> = graph.op_ids().into();
            let mut queued: HashSet<OpId> = queue.iter().copied().collect();
            let mut fired_this_round = false;
            let mut touched_this_round: HashSet<TensorId> = HashSet::new();

            while let Some(op_id) = queue.pop_front() {
                queued.remove(&op_id);
                if !graph.has_op(op_id) {
                    continue;
                }
                for pattern in &patterns {
                    let op = graph.op(op_id)?;
                    if !pattern.matches(op, graph)? {
                        continue;
                    }
                    let touches = pattern.touches(op, graph)?;
                    // Two overlapping rewrites in one round: the first
                    // (higher-priority) fired, the second waits for the
                    // next round with the updated neighborhood.
                    if touches.iter().any(|t| touched_this_round.contains(t)) {
                        continue;
                    }
                    debug!(pattern = pattern.name(), op = op_id, "applying pattern");
                    if !pattern.apply(op_id, graph)? {
                        return Err(error!(
                            ErrorKind::InternalLogicError,
                            "pattern {} matched but failed to apply",
                            pattern.name()
                        ));
                    }
                    fired_this_round = true;
                    any_fired = true;
                    for tensor in &touches {
                        touched_this_round.insert(tensor.clone());
                        if let Ok(t) = graph.tensor(tensor) {
                            let mut neighbors = t.consumers.ops();
                            if let Some(producer) = t.producer {
                                neighbors.push(producer);
                            }
                            for neighbor in neighbors {
                                if queued.insert(neighbor) {
                                    queue.push_back(neighbor);
                                }
                            }
                        }
                    }
                    break;
                }
            }

            if !fired_this_round {
                break;
            }
        }
        Ok(any_fired)
    }
}

/// The registered pre-alias patterns, highest priority first.
fn pre_alias_list() -> Vec<Box<dyn Pattern>> {
    vec![
        Box::new(SoftmaxGradDirect),
        Box::new(PreUniRepl),
        Box::new(NegSubToSubSwap),
        Box::new(OpToIdentity),
    ]
}

/// Convenience entry point with the default configuration.
pub fn apply_pre_alias(graph: &mut Graph) -> Result<bool> {
    Patterns::default().apply_pre_alias(graph)
}

/// Replaces `old` with a freshly built op over `inputs`, taking over the
/// old op's outputs, settings, loss markers and topological constraints.
pub(crate) fn replace_op(
    graph: &mut Graph,
    old: OpId,
    operator: OperatorId,
    attrs: crate::attributes::Attributes,
    inputs: &[TensorId],
) -> Result<OpId> {
    let old_op = graph.op(old)?.clone();
    let outputs: Vec<(usize, TensorId)> = old_op
        .outputs()
        .map(|(i, t)| (i, t.clone()))
        .collect();
    graph.disconnect_all_inputs(old)?;
    graph.disconnect_all_outputs(old)?;

    let mut settings = OpSettings::named(old_op.settings.name.clone());
    settings.virtual_graph_id = old_op.settings.virtual_graph_id;
    settings.pipeline_stage = old_op.settings.pipeline_stage;
    settings.execution_phase = old_op.settings.execution_phase;
    settings.batch_serialized_phase = old_op.settings.batch_serialized_phase;
    settings.recompute = old_op.settings.recompute;
    settings.priority = old_op.settings.priority;

    let new = graph.add_op(operator, attrs, settings);
    for (index, tensor) in inputs.iter().enumerate() {
        graph.connect_in(new, index, tensor)?;
    }
    for (index, tensor) in outputs {
        graph.connect_out(new, index, &tensor)?;
    }
    graph.setup_op(new)?;
    {
        let new_op = graph.op_mut(new)?;
        new_op.path_to_loss = old_op.path_to_loss;
        new_op.from_loss = old_op.from_loss;
    }
    graph.topo_cons.transfer(old, new)?;
    graph.erase_op(old)?;
    Ok(new)
}

/// Erases a producer chain that became dead after a rewrite: the op and
/// its now-unconsumed outputs.
pub(crate) fn erase_if_unconsumed(graph: &mut Graph, op: OpId) -> Result<bool> {
    if !graph.has_op(op) {
        return Ok(false);
    }
    let outputs = graph.op(op)?.output_ids();
    for tensor in &outputs {
        if graph.tensor(tensor)?.consumers.total() > 0 {
            return Ok(false);
        }
    }
    graph.erase_op(op)?;
    for tensor in outputs {
        graph.remove_isolated_tensor(&tensor)?;
    }
    Ok(true)
}
