//! Process-wide op catalog: schemas, shape inference, gradients, const-expr
//! kernels and inplace variants, keyed by `(domain, name, version)`.
//!
//! The catalog is a write-once table populated by [`register_builtin_ops`];
//! after initialization it is read-only and safe for concurrent lookups.

mod accel;
mod foldutil;
mod math;
mod nn;
mod shape_ops;

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;

use crate::attributes::Attributes;
use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::op::{Op, OperatorId, ACCEL_DOMAIN, ONNX_DOMAIN};
use crate::shape::TensorInfo;

pub use foldutil::FoldCtx;

/// Input arity accepted by an op schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// At least `min` inputs, unbounded above.
    Variadic { min: usize },
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Fixed(k) => n == k,
            Arity::Variadic { min } => n >= min,
        }
    }
}

/// Read-only view handed to shape-inference hooks.
pub struct SetupCtx<'a> {
    pub op: &'a Op,
    inputs: &'a BTreeMap<usize, TensorInfo>,
}

impl<'a> SetupCtx<'a> {
    pub fn new(op: &'a Op, inputs: &'a BTreeMap<usize, TensorInfo>) -> Self {
        SetupCtx { op, inputs }
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn in_info(&self, index: usize) -> Result<&TensorInfo> {
        self.inputs.get(&index).ok_or_else(|| {
            error!(
                ErrorKind::InternalLogicError,
                "setup of {} requires input {index}, which is not connected",
                self.op.debug_name()
            )
        })
    }

    pub fn in_shape(&self, index: usize) -> Result<&[i64]> {
        Ok(self.in_info(index)?.shape())
    }

    pub fn in_dtype(&self, index: usize) -> Result<DType> {
        Ok(self.in_info(index)?.dtype())
    }
}

/// Shape inference: output infos by output index, computed from input infos
/// and attributes only.
pub type SetupFn = fn(&SetupCtx) -> Result<Vec<TensorInfo>>;

/// Where a grad op pulls one of its inputs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradSource {
    /// The gradient of the forward op's output at `fwd_index`.
    GradOfOutput,
    /// The forward op's output at `fwd_index`.
    Output,
    /// The forward op's input at `fwd_index`.
    Input,
}

/// One input connection of a grad op.
#[derive(Debug, Clone, Copy)]
pub struct GradInput {
    pub grad_in: usize,
    pub fwd_index: usize,
    pub source: GradSource,
}

impl GradInput {
    pub const fn new(grad_in: usize, fwd_index: usize, source: GradSource) -> Self {
        GradInput {
            grad_in,
            fwd_index,
            source,
        }
    }
}

/// Recipe for one grad op to instantiate when differentiating a forward op.
#[derive(Debug, Clone)]
pub struct GradOpSpec {
    pub operator: OperatorId,
    pub attrs: Attributes,
    pub grad_inputs: Vec<GradInput>,
    /// Which grad-op output carries the gradient of which forward input.
    pub grad_out_to_fwd_in: Vec<(usize, usize)>,
}

/// Enumerates the grad ops of a forward op, given its wired infos.
pub type GradFn = fn(&Op, &crate::graph::Graph) -> Result<Vec<GradOpSpec>>;

/// Const-expr kernel: evaluate the op on Const input bytes.
pub type FoldFn = fn(&FoldCtx) -> Result<Vec<u8>>;

/// An inplace candidate with its selection priority.
#[derive(Debug, Clone)]
pub struct InplaceVariant {
    pub operator: OperatorId,
    pub priority: f64,
}

/// Capability and classification flags consulted by transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFlags {
    /// Normalization op (NormOnly recompute tags these).
    pub norm: bool,
    /// Elementwise single-input op.
    pub elementwise_unary: bool,
    /// Weight/optimizer-state update; a training target for pruning.
    pub var_update: bool,
    pub loss: bool,
    /// Cross-stage copy inserted by the pipelining transform.
    pub copy: bool,
    /// May be split along the batch axis by batch serialization.
    pub shardable: bool,
    /// Every input aliases into the output (variadic inplace concat).
    pub alias_variadic: bool,
}

/// The registered behavior bundle of one operator id.
pub struct OpDef {
    pub arity: Arity,
    pub n_outputs: usize,
    /// Allowed element types per input index; unlisted indices are
    /// unconstrained.
    pub constraints: &'static [(usize, &'static [DType])],
    pub setup: SetupFn,
    pub grad: Option<GradFn>,
    pub fold: Option<FoldFn>,
    pub inplace_variants: Option<fn(&Op) -> Vec<InplaceVariant>>,
    /// Input indices whose tensors are mutated in place.
    pub modifies: &'static [usize],
    /// (input index, output index) alias pairs.
    pub aliases: &'static [(usize, usize)],
    pub flags: OpFlags,
}

impl OpDef {
    pub fn new(arity: Arity, n_outputs: usize, setup: SetupFn) -> Self {
        OpDef {
            arity,
            n_outputs,
            constraints: &[],
            setup,
            grad: None,
            fold: None,
            inplace_variants: None,
            modifies: &[],
            aliases: &[],
            flags: OpFlags::default(),
        }
    }

    pub fn with_grad(mut self, grad: GradFn) -> Self {
        self.grad = Some(grad);
        self
    }

    pub fn with_fold(mut self, fold: FoldFn) -> Self {
        self.fold = Some(fold);
        self
    }

    pub fn with_inplace(mut self, variants: fn(&Op) -> Vec<InplaceVariant>) -> Self {
        self.inplace_variants = Some(variants);
        self
    }

    pub fn with_constraints(mut self, constraints: &'static [(usize, &'static [DType])]) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn modifying(mut self, modifies: &'static [usize]) -> Self {
        self.modifies = modifies;
        self
    }

    pub fn aliasing(mut self, aliases: &'static [(usize, usize)]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn flags(mut self, flags: OpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn shardable(mut self) -> Self {
        self.flags.shardable = true;
        self
    }

    pub fn elementwise_unary(mut self) -> Self {
        self.flags.elementwise_unary = true;
        self
    }

    pub fn modifies(&self, index: usize) -> bool {
        self.modifies.contains(&index)
    }

    pub fn aliases(&self, in_index: usize, out_index: usize) -> bool {
        self.flags.alias_variadic && out_index == 0
            || self.aliases.contains(&(in_index, out_index))
    }
}

/// Operator ids of every builtin op, in one place so call sites agree on
/// the `(domain, name, version)` triples.
pub mod catalog {
    use crate::op::OperatorId;

    pub const ADD: OperatorId = OperatorId::onnx("Add", 7);
    pub const SUB: OperatorId = OperatorId::onnx("Sub", 7);
    pub const MUL: OperatorId = OperatorId::onnx("Mul", 7);
    pub const DIV: OperatorId = OperatorId::onnx("Div", 7);
    pub const NEG: OperatorId = OperatorId::onnx("Neg", 6);
    pub const SUM: OperatorId = OperatorId::onnx("Sum", 8);
    pub const IDENTITY: OperatorId = OperatorId::onnx("Identity", 1);
    pub const RELU: OperatorId = OperatorId::onnx("Relu", 6);
    pub const MATMUL: OperatorId = OperatorId::onnx("MatMul", 9);
    pub const TRANSPOSE: OperatorId = OperatorId::onnx("Transpose", 1);
    pub const RESHAPE: OperatorId = OperatorId::onnx("Reshape", 1);
    pub const FLATTEN: OperatorId = OperatorId::onnx("Flatten", 1);
    pub const CAST: OperatorId = OperatorId::onnx("Cast", 9);
    pub const SLICE: OperatorId = OperatorId::onnx("Slice", 1);
    pub const CONCAT: OperatorId = OperatorId::onnx("Concat", 4);
    pub const PAD: OperatorId = OperatorId::onnx("Pad", 2);
    pub const SOFTMAX: OperatorId = OperatorId::onnx("Softmax", 1);
    pub const REDUCE_SUM: OperatorId = OperatorId::onnx("ReduceSum", 1);
    pub const GATHER: OperatorId = OperatorId::onnx("Gather", 1);
    pub const TOPK: OperatorId = OperatorId::onnx("TopK", 1);
    pub const CONV: OperatorId = OperatorId::onnx("Conv", 1);
    pub const BATCH_NORM: OperatorId = OperatorId::onnx("BatchNormalization", 7);

    pub const SQUARE: OperatorId = OperatorId::accel("Square");
    pub const SCALE: OperatorId = OperatorId::accel("Scale");
    pub const INIT: OperatorId = OperatorId::accel("Init");
    pub const TILE_COPY: OperatorId = OperatorId::accel("TileCopy");
    pub const STASH: OperatorId = OperatorId::accel("Stash");
    pub const RESTORE: OperatorId = OperatorId::accel("Restore");
    pub const RESTORE_INPLACE: OperatorId = OperatorId::accel("RestoreInplace");
    pub const DYNAMIC_SLICE: OperatorId = OperatorId::accel("DynamicSlice");
    pub const DYNAMIC_UPDATE: OperatorId = OperatorId::accel("DynamicUpdate");
    pub const CONCAT_INPLACE: OperatorId = OperatorId::accel("ConcatInplace");
    pub const FLATTEN_INPLACE: OperatorId = OperatorId::accel("FlattenInplace");
    pub const RESHAPE_INPLACE: OperatorId = OperatorId::accel("ReshapeInplace");
    pub const RELU_INPLACE: OperatorId = OperatorId::accel("ReluInplace");

    pub const SGD0_VAR_UPDATE: OperatorId = OperatorId::accel("Sgd0VarUpdate");
    pub const SGD1_ACCUMULATE: OperatorId = OperatorId::accel("Sgd1Accumulate");
    pub const SGD1_VAR_UPDATE: OperatorId = OperatorId::accel("Sgd1VarUpdate");

    pub const L1: OperatorId = OperatorId::accel("L1");
    pub const NLL: OperatorId = OperatorId::accel("Nll");
    pub const IDENTITY_LOSS: OperatorId = OperatorId::accel("IdentityLoss");

    pub const REDUCE_SUM_TO_SHAPE: OperatorId = OperatorId::accel("ReduceSumToShape");
    pub const SUB_ARG1_GRAD: OperatorId = OperatorId::accel("SubArg1Grad");
    pub const MUL_ARG0_GRAD: OperatorId = OperatorId::accel("MulArg0Grad");
    pub const MUL_ARG1_GRAD: OperatorId = OperatorId::accel("MulArg1Grad");
    pub const DIV_ARG0_GRAD: OperatorId = OperatorId::accel("DivArg0Grad");
    pub const DIV_ARG1_GRAD: OperatorId = OperatorId::accel("DivArg1Grad");
    pub const RELU_GRAD: OperatorId = OperatorId::accel("ReluGrad");
    pub const SQUARE_GRAD: OperatorId = OperatorId::accel("SquareGrad");
    pub const MATMUL_LHS_GRAD: OperatorId = OperatorId::accel("MatMulLhsGrad");
    pub const MATMUL_RHS_GRAD: OperatorId = OperatorId::accel("MatMulRhsGrad");
    pub const SOFTMAX_GRAD: OperatorId = OperatorId::accel("SoftmaxGrad");
    pub const SOFTMAX_GRAD_DIRECT: OperatorId = OperatorId::accel("SoftmaxGradDirect");
    pub const REDUCE_SUM_GRAD: OperatorId = OperatorId::accel("ReduceSumGrad");
    pub const GATHER_GRAD: OperatorId = OperatorId::accel("GatherGrad");
    pub const TOPK_GRAD: OperatorId = OperatorId::accel("TopKGrad");
    pub const CONV_DATA_GRAD: OperatorId = OperatorId::accel("ConvDataGrad");
    pub const CONV_WEIGHTS_GRAD: OperatorId = OperatorId::accel("ConvWeightsGrad");
    pub const L1_GRAD: OperatorId = OperatorId::accel("L1Grad");
    pub const NLL_GRAD: OperatorId = OperatorId::accel("NllGrad");
    pub const IDENTITY_LOSS_GRAD: OperatorId = OperatorId::accel("IdentityLossGrad");
}

/// Registration surface handed to the per-module `register` functions.
pub struct Registry {
    defs: HashMap<OperatorId, OpDef>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            defs: HashMap::new(),
        }
    }

    /// Inserts a definition; a second registration of the same operator id
    /// is a programming error (the table is write-once).
    pub fn insert(&mut self, operator: OperatorId, def: OpDef) {
        let display = operator.to_string();
        if self.defs.insert(operator, def).is_some() {
            panic!("operator {display} registered twice");
        }
    }
}

static BUILTINS: Lazy<HashMap<OperatorId, OpDef>> = Lazy::new(|| {
    let mut registry = Registry::new();
    math::register(&mut registry);
    shape_ops::register(&mut registry);
    nn::register(&mut registry);
    accel::register(&mut registry);
    registry.defs
});

/// Looks up the behavior bundle of an operator id.
pub fn opdef(operator: &OperatorId) -> Result<&'static OpDef> {
    BUILTINS.get(operator).ok_or_else(|| {
        error!(ErrorKind::UnknownOperator, "no registered operator {operator}")
    })
}

pub fn is_registered(operator: &OperatorId) -> bool {
    BUILTINS.contains_key(operator)
}

/// Resolves an ONNX node's `(domain, op_type)` against an opset version:
/// the highest registered version not exceeding `opset_version` wins.
pub fn resolve(domain: &str, name: &str, opset_version: i64) -> Result<OperatorId> {
    let domain = match domain {
        "" | ONNX_DOMAIN => ONNX_DOMAIN,
        ACCEL_DOMAIN => ACCEL_DOMAIN,
        other => {
            return Err(error!(
                ErrorKind::UnknownOperator,
                "unrecognized operator domain {other}"
            ))
        }
    };
    BUILTINS
        .keys()
        .filter(|id| id.domain == domain && id.name == name && id.version <= opset_version)
        .max_by_key(|id| id.version)
        .cloned()
        .ok_or_else(|| {
            error!(
                ErrorKind::UnknownOperator,
                "no operator {domain}.{name} available at opset {opset_version}"
            )
        })
}

/// Checks a wired op against its schema: arity and element-type
/// constraints.
pub fn check_schema(op: &Op, inputs: &BTreeMap<usize, TensorInfo>) -> Result<()> {
    let def = opdef(&op.operator)?;
    if !def.arity.accepts(inputs.len()) {
        return Err(error!(
            ErrorKind::UnknownOperator,
            "op {} has {} inputs, schema expects {:?}",
            op.debug_name(),
            inputs.len(),
            def.arity
        ));
    }
    for &(index, allowed) in def.constraints {
        if let Some(info) = inputs.get(&index) {
            if !allowed.contains(&info.dtype()) {
                return Err(error!(
                    ErrorKind::TypeMismatch,
                    "op {} input {index} has element type {}, not in the allowed set",
                    op.debug_name(),
                    info.dtype().onnx_name()
                ));
            }
        }
    }
    Ok(())
}

/// Forces catalog initialization; useful before spawning worker threads so
/// the lazily built table is in place.
pub fn register_builtin_ops() {
    Lazy::force(&BUILTINS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_picks_highest_version_at_or_below_opset() {
        let id = resolve("", "Add", 13).unwrap();
        assert_eq!(id, catalog::ADD);
        assert!(resolve("", "Add", 1).is_err());
        assert!(resolve("", "NoSuchOp", 13).is_err());
    }

    #[test]
    fn every_catalog_entry_is_registered() {
        register_builtin_ops();
        for id in [catalog::ADD, catalog::STASH, catalog::SGD0_VAR_UPDATE, catalog::TOPK_GRAD] {
            assert!(is_registered(&id), "{id} missing from registry");
        }
    }
}
