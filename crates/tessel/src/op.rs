//! The op value: operator identity, settings, attributes and wired tensors.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;

use crate::attributes::Attributes;
use crate::error::{error, ErrorKind, Result};
use crate::tensor::TensorId;

/// Stable numeric identity of an op, unique within one IR.
pub type OpId = u64;

/// Operator domains recognized by the catalog.
pub const ONNX_DOMAIN: &str = "ai.onnx";
/// The accelerator's own domain, for ops with no ONNX counterpart.
pub const ACCEL_DOMAIN: &str = "tessel.accel";

/// Domain-qualified operator identity `(domain, name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperatorId {
    pub domain: &'static str,
    pub name: &'static str,
    pub version: i64,
}

impl OperatorId {
    pub const fn onnx(name: &'static str, version: i64) -> Self {
        OperatorId {
            domain: ONNX_DOMAIN,
            name,
            version,
        }
    }

    pub const fn accel(name: &'static str) -> Self {
        OperatorId {
            domain: ACCEL_DOMAIN,
            name,
            version: 1,
        }
    }

    pub fn is_accel(&self) -> bool {
        self.domain == ACCEL_DOMAIN
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.domain, self.name, self.version)
    }
}

/// Whether the outputs of a forward op are kept for the backward pass or
/// re-derived on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecomputeKind {
    #[default]
    Undefined,
    Checkpoint,
    Recompute,
}

/// Loss-relative position markers maintained by the autodiff builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossRelation {
    #[default]
    Undefined,
    Yes,
    No,
}

/// Per-op scheduling and placement settings.
#[derive(Debug, Clone, Default)]
pub struct OpSettings {
    /// Human-readable name, usually carried over from the ONNX node.
    pub name: String,
    /// Tile-group the op is mapped to.
    pub virtual_graph_id: Option<i64>,
    pub pipeline_stage: Option<i64>,
    pub execution_phase: Option<i64>,
    /// Which of the `factor` serialized copies this op belongs to.
    pub batch_serialized_phase: Option<i64>,
    pub recompute: RecomputeKind,
    /// Larger runs earlier among schedulable ops.
    pub priority: f64,
}

impl OpSettings {
    pub fn named(name: impl Into<String>) -> Self {
        OpSettings {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A typed operation. Wiring to tensors goes through the owning graph's
/// primitives; the maps here are the graph-maintained record of it.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: OpId,
    pub operator: OperatorId,
    pub settings: OpSettings,
    pub attrs: Attributes,
    pub(crate) inputs: BTreeMap<usize, TensorId>,
    pub(crate) outputs: BTreeMap<usize, TensorId>,
    pub path_to_loss: LossRelation,
    pub from_loss: LossRelation,
}

impl Op {
    pub(crate) fn new(id: OpId, operator: OperatorId, settings: OpSettings, attrs: Attributes) -> Self {
        Op {
            id,
            operator,
            settings,
            attrs,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            path_to_loss: LossRelation::Undefined,
            from_loss: LossRelation::Undefined,
        }
    }

    pub fn input(&self, index: usize) -> Result<&TensorId> {
        self.inputs.get(&index).ok_or_else(|| {
            error!(
                ErrorKind::InternalLogicError,
                "op {} has no input at index {index}",
                self.debug_name()
            )
        })
    }

    pub fn output(&self, index: usize) -> Result<&TensorId> {
        self.outputs.get(&index).ok_or_else(|| {
            error!(
                ErrorKind::InternalLogicError,
                "op {} has no output at index {index}",
                self.debug_name()
            )
        })
    }

    pub fn has_input(&self, index: usize) -> bool {
        self.inputs.contains_key(&index)
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Input map entries in index order.
    pub fn inputs(&self) -> impl Iterator<Item = (usize, &TensorId)> {
        self.inputs.iter().map(|(i, t)| (*i, t))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (usize, &TensorId)> {
        self.outputs.iter().map(|(i, t)| (*i, t))
    }

    pub fn input_ids(&self) -> Vec<TensorId> {
        self.inputs.values().cloned().collect()
    }

    pub fn output_ids(&self) -> Vec<TensorId> {
        self.outputs.values().cloned().collect()
    }

    /// All input indices at which this op consumes `tensor`.
    pub fn input_indices(&self, tensor: &str) -> SmallVec<[usize; 2]> {
        self.inputs
            .iter()
            .filter(|(_, t)| t.as_str() == tensor)
            .map(|(i, _)| *i)
            .collect()
    }

    /// The output index at which this op produces `tensor`, if any.
    pub fn output_index(&self, tensor: &str) -> Option<usize> {
        self.outputs
            .iter()
            .find(|(_, t)| t.as_str() == tensor)
            .map(|(i, _)| *i)
    }

    pub fn debug_name(&self) -> String {
        if self.settings.name.is_empty() {
            format!("{} ({})", self.id, self.operator.name)
        } else {
            format!("{} ({}, \"{}\")", self.id, self.operator.name, self.settings.name)
        }
    }
}
