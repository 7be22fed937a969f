//! Tensors, their classes, consumer bookkeeping and reserved-id roles.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{error, ErrorKind, Result};
use crate::op::OpId;
use crate::shape::TensorInfo;

pub type TensorId = String;

/// Storage class of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorClass {
    /// Fed from the host each step; never has a producer.
    Stream,
    /// Persistent trainable or otherwise updated state.
    Variable,
    /// Compile-time literal with an attached buffer.
    Const,
    /// Transient activation or gradient.
    ActGrad,
    /// Optimizer velocity/accumulator state.
    Momentum,
    /// Cached intermediate state.
    Cache,
}

impl fmt::Display for TensorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorClass::Stream => "Stream",
            TensorClass::Variable => "Variable",
            TensorClass::Const => "Const",
            TensorClass::ActGrad => "ActGrad",
            TensorClass::Momentum => "Momentum",
            TensorClass::Cache => "Cache",
        };
        f.write_str(name)
    }
}

/// Host-side byte buffer attached to Const/Variable/Momentum tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorData {
    bytes: Vec<u8>,
}

impl TensorData {
    pub fn new(bytes: Vec<u8>) -> Self {
        TensorData { bytes }
    }

    pub fn zeros(nbytes: usize) -> Self {
        TensorData {
            bytes: vec![0u8; nbytes],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Per-tensor consumer counts, keyed by consuming op. An op appears once per
/// input index at which it consumes the tensor.
#[derive(Debug, Clone, Default)]
pub struct Consumers {
    counts: BTreeMap<OpId, usize>,
}

impl Consumers {
    pub fn increment(&mut self, op: OpId) {
        *self.counts.entry(op).or_insert(0) += 1;
    }

    pub fn decrement(&mut self, op: OpId) -> Result<()> {
        match self.counts.get_mut(&op) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                self.counts.remove(&op);
                Ok(())
            }
            None => Err(error!(
                ErrorKind::InternalLogicError,
                "decrementing absent consumer op {op}"
            )),
        }
    }

    /// Total number of input-edge occurrences across all consumers.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, op: OpId) -> usize {
        self.counts.get(&op).copied().unwrap_or(0)
    }

    /// Consuming ops in ascending op-id order.
    pub fn ops(&self) -> Vec<OpId> {
        self.counts.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// A value in the dataflow graph. Produced by at most one op; the element
/// type and rank never change once the info is set.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub class: TensorClass,
    pub(crate) info: Option<TensorInfo>,
    pub(crate) producer: Option<OpId>,
    pub consumers: Consumers,
    pub(crate) data: Option<TensorData>,
}

impl Tensor {
    pub(crate) fn new(id: TensorId, class: TensorClass, info: Option<TensorInfo>) -> Self {
        Tensor {
            id,
            class,
            info,
            producer: None,
            consumers: Consumers::default(),
            data: None,
        }
    }

    pub fn info(&self) -> Result<&TensorInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| error!(ErrorKind::InternalLogicError, "tensor {} has unset info", self.id))
    }

    pub fn has_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn has_producer(&self) -> bool {
        self.producer.is_some()
    }

    pub fn producer(&self) -> Result<OpId> {
        self.producer.ok_or_else(|| {
            error!(ErrorKind::MissingProducer, "tensor {} has no producer", self.id)
        })
    }

    pub fn data(&self) -> Option<&TensorData> {
        self.data.as_ref()
    }

    pub fn data_mut(&mut self) -> Option<&mut TensorData> {
        self.data.as_mut()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn role(&self) -> TensorRole {
        role_of(&self.id)
    }
}

/// Reserved tensor-id prefixes. These are a protocol shared between the
/// autodiff builder, the optimizer and the transforms; the store derives a
/// tensor's role from its prefix alone.
pub mod reserved {
    pub const GRAD_PREFIX: &str = "Grad___";
    pub const ACCL_PREFIX: &str = "Accl___";
    pub const RECOMPUTE_PREFIX: &str = "Recompute___";
    pub const RANDOM_SEED_PREFIX: &str = "RandomSeed___";
    pub const REMOTE_ARG_PREFIX: &str = "RemoteArg___";

    pub const SCALED_LEARNING_RATE_0_PREFIX: &str = "ScaledLearningRate0___";
    pub const WEIGHT_DECAY_SCALE_FACTOR_0_PREFIX: &str = "WeightDecayScaleFactor0___";
    pub const SCALED_LEARNING_RATE_1_PREFIX: &str = "ScaledLearningRate1___";
    pub const WEIGHT_DECAY_SCALE_FACTOR_1_PREFIX: &str = "WeightDecayScaleFactor1___";
    pub const DAMPENING_SCALE_FACTOR_1_PREFIX: &str = "DampeningScaleFactor1___";
    pub const MOMENTUM_1_PREFIX: &str = "Momentum1___";
    pub const LOSS_SCALING_PREFIX: &str = "LossScaling___";

    pub const OPTIMIZER_PREFIXES: &[&str] = &[
        SCALED_LEARNING_RATE_0_PREFIX,
        WEIGHT_DECAY_SCALE_FACTOR_0_PREFIX,
        SCALED_LEARNING_RATE_1_PREFIX,
        WEIGHT_DECAY_SCALE_FACTOR_1_PREFIX,
        DAMPENING_SCALE_FACTOR_1_PREFIX,
        MOMENTUM_1_PREFIX,
        LOSS_SCALING_PREFIX,
    ];

    /// The canonical gradient id of a forward tensor.
    pub fn grad_id(id: &str) -> String {
        format!("{GRAD_PREFIX}{id}")
    }

    /// One partial gradient contribution, disambiguated by the grad op that
    /// produced it and the output index it flowed from.
    pub fn edge_grad_id(id: &str, grad_op: u64, index: usize) -> String {
        format!("{GRAD_PREFIX}{id}___edge_{grad_op}_{index}")
    }

    pub fn accl_id(id: &str) -> String {
        format!("{ACCL_PREFIX}{id}")
    }

    pub fn recompute_id(id: &str) -> String {
        format!("{RECOMPUTE_PREFIX}{id}")
    }

    pub fn updated_id(id: &str) -> String {
        format!("{id}___updated")
    }
}

/// Role of a tensor, derived from its reserved id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Accumulator,
    OptimizerScalar,
    RandomSeed,
    RemoteArg,
    Gradient,
    Default,
}

pub fn role_of(id: &str) -> TensorRole {
    if id.starts_with(reserved::ACCL_PREFIX) {
        TensorRole::Accumulator
    } else if reserved::OPTIMIZER_PREFIXES.iter().any(|p| id.starts_with(p)) {
        TensorRole::OptimizerScalar
    } else if id.starts_with(reserved::RANDOM_SEED_PREFIX) {
        TensorRole::RandomSeed
    } else if id.starts_with(reserved::REMOTE_ARG_PREFIX) {
        TensorRole::RemoteArg
    } else if id.starts_with(reserved::GRAD_PREFIX) {
        TensorRole::Gradient
    } else {
        TensorRole::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_counts_track_edge_occurrences() {
        let mut consumers = Consumers::default();
        consumers.increment(3);
        consumers.increment(3);
        consumers.increment(5);
        assert_eq!(consumers.total(), 3);
        assert_eq!(consumers.count(3), 2);
        consumers.decrement(3).unwrap();
        assert_eq!(consumers.count(3), 1);
        consumers.decrement(3).unwrap();
        assert_eq!(consumers.count(3), 0);
        assert_eq!(consumers.ops(), vec![5]);
        assert!(consumers.decrement(3).is_err());
    }

    #[test]
    fn roles_follow_reserved_prefixes() {
        assert_eq!(role_of(&reserved::accl_id("w")), TensorRole::Accumulator);
        assert_eq!(
            role_of(&format!("{}F32", reserved::SCALED_LEARNING_RATE_0_PREFIX)),
            TensorRole::OptimizerScalar
        );
        assert_eq!(role_of(&reserved::grad_id("act")), TensorRole::Gradient);
        assert_eq!(role_of("plain"), TensorRole::Default);
    }
}
