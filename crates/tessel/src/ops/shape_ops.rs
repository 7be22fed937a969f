//! View and layout ops: identity, transpose, reshape, cast, slice, concat,
//! pad, gather. Most have const-expr kernels and reuse each other as their
//! own gradients.

use crate::attributes::{AttrValue, Attributes};
use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::op::Op;
use crate::ops::foldutil::{self, FoldCtx};
use crate::ops::{
    catalog, Arity, GradInput, GradOpSpec, GradSource, InplaceVariant, OpDef, Registry, SetupCtx,
};
use crate::shape::TensorInfo;

pub(super) fn register(registry: &mut Registry) {
    registry.insert(
        catalog::IDENTITY,
        OpDef::new(Arity::Fixed(1), 1, setup_identity)
            .with_grad(grad_identity)
            .with_fold(fold_copy)
            .elementwise_unary()
            .shardable(),
    );
    registry.insert(
        catalog::TRANSPOSE,
        OpDef::new(Arity::Fixed(1), 1, setup_transpose)
            .with_grad(grad_transpose)
            .with_fold(fold_transpose),
    );
    registry.insert(
        catalog::RESHAPE,
        OpDef::new(Arity::Fixed(1), 1, setup_reshape)
            .with_grad(grad_reshape)
            .with_fold(fold_copy)
            .with_inplace(|_| {
                vec![InplaceVariant {
                    operator: catalog::RESHAPE_INPLACE,
                    priority: 10.0,
                }]
            }),
    );
    registry.insert(
        catalog::FLATTEN,
        OpDef::new(Arity::Fixed(1), 1, setup_flatten)
            .with_grad(grad_reshape)
            .with_fold(fold_copy)
            .with_inplace(|_| {
                vec![InplaceVariant {
                    operator: catalog::FLATTEN_INPLACE,
                    priority: 10.0,
                }]
            }),
    );
    registry.insert(
        catalog::CAST,
        OpDef::new(Arity::Fixed(1), 1, setup_cast)
            .with_grad(grad_cast)
            .with_fold(fold_cast),
    );
    registry.insert(
        catalog::SLICE,
        OpDef::new(Arity::Fixed(1), 1, setup_slice)
            .with_grad(grad_slice)
            .with_fold(fold_slice),
    );
    registry.insert(
        catalog::CONCAT,
        OpDef::new(Arity::Variadic { min: 1 }, 1, setup_concat)
            .with_grad(grad_concat)
            .with_fold(fold_concat)
            .with_inplace(|_| {
                vec![InplaceVariant {
                    operator: catalog::CONCAT_INPLACE,
                    priority: 10.0,
                }]
            }),
    );
    registry.insert(
        catalog::PAD,
        OpDef::new(Arity::Fixed(1), 1, setup_pad).with_grad(grad_pad),
    );
    registry.insert(
        catalog::GATHER,
        OpDef::new(Arity::Fixed(2), 1, setup_gather)
            .with_constraints(&[(1, &[DType::Int32, DType::Int64])])
            .with_grad(grad_gather),
    );
    registry.insert(
        catalog::GATHER_GRAD,
        OpDef::new(Arity::Fixed(2), 1, super::math::setup_to_target_shape),
    );
}

fn setup_identity(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(0)?.clone()])
}

pub(super) fn permutation(op: &Op, rank: usize) -> Result<Vec<usize>> {
    let raw = op.attrs.ints_or_empty("perm")?;
    let perm: Vec<usize> = if raw.is_empty() {
        // Default permutation reverses the axes, as in numpy.
        (0..rank).rev().collect()
    } else {
        raw.iter().map(|&axis| axis as usize).collect()
    };
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&axis| axis >= rank || std::mem::replace(&mut seen[axis], true)) {
        return Err(error!(
            ErrorKind::InvalidPermutation,
            "perm {perm:?} is not a permutation of rank {rank}"
        ));
    }
    Ok(perm)
}

fn setup_transpose(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let perm = permutation(ctx.op, input.rank())?;
    let shape: Vec<i64> = perm.iter().map(|&axis| input.dim(axis)).collect();
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

pub(super) fn setup_reshape(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let spec = ctx.op.attrs.ints("shape")?;
    let known: i64 = spec.iter().filter(|&&d| d != -1).product();
    let mut shape = Vec::with_capacity(spec.len());
    for &dim in spec {
        if dim == -1 {
            if known == 0 {
                return Err(error!(
                    ErrorKind::ShapeMismatch,
                    "cannot infer -1 extent in reshape to {spec:?}"
                ));
            }
            shape.push(input.nelms() / known);
        } else {
            shape.push(dim);
        }
    }
    let out = TensorInfo::new(input.dtype(), shape);
    if out.nelms() != input.nelms() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "reshape of {input} to {spec:?} changes the element count"
        ));
    }
    Ok(vec![out])
}

pub(super) fn setup_flatten(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let axis = ctx.op.attrs.int_or("axis", 1)? as usize;
    if axis > input.rank() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "flatten axis {axis} out of range for {input}"
        ));
    }
    let outer: i64 = input.shape()[..axis].iter().product();
    let inner: i64 = input.shape()[axis..].iter().product();
    Ok(vec![TensorInfo::new(input.dtype(), vec![outer, inner])])
}

fn setup_cast(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let to = DType::from_onnx_tag(ctx.op.attrs.int("to")? as i32)?;
    Ok(vec![TensorInfo::new(to, ctx.in_shape(0)?.to_vec())])
}

pub(super) fn slice_bounds(op: &Op, input: &TensorInfo) -> Result<(Vec<i64>, Vec<i64>)> {
    let starts_attr = op.attrs.ints("starts")?;
    let ends_attr = op.attrs.ints("ends")?;
    let axes_attr = op.attrs.ints_or_empty("axes")?;
    let axes: Vec<usize> = if axes_attr.is_empty() {
        (0..starts_attr.len()).collect()
    } else {
        axes_attr.iter().map(|&a| a as usize).collect()
    };
    if axes.len() != starts_attr.len() || axes.len() != ends_attr.len() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "slice starts/ends/axes lengths disagree on op {}",
            op.debug_name()
        ));
    }
    let mut starts: Vec<i64> = vec![0; input.rank()];
    let mut ends: Vec<i64> = input.shape().to_vec();
    for (position, &axis) in axes.iter().enumerate() {
        if axis >= input.rank() {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "slice axis {axis} out of range for {input}"
            ));
        }
        let dim = input.dim(axis);
        let clamp = |v: i64| -> i64 {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim)
        };
        starts[axis] = clamp(starts_attr[position]);
        ends[axis] = clamp(ends_attr[position]);
        if ends[axis] < starts[axis] {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "slice bounds [{}, {}) are empty on axis {axis} of {input}",
                starts[axis],
                ends[axis]
            ));
        }
    }
    Ok((starts, ends))
}

fn setup_slice(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let (starts, ends) = slice_bounds(ctx.op, input)?;
    let shape: Vec<i64> = starts.iter().zip(ends.iter()).map(|(s, e)| e - s).collect();
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

pub(super) fn setup_concat(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let first = ctx.in_info(0)?;
    let rank = first.rank();
    let axis = normalize_axis(ctx.op.attrs.int("axis")?, rank)?;
    let mut shape = first.shape().to_vec();
    for index in 1..ctx.n_inputs() {
        let info = ctx.in_info(index)?;
        if info.dtype() != first.dtype() {
            return Err(error!(
                ErrorKind::TypeMismatch,
                "concat operands disagree on element type"
            ));
        }
        if info.rank() != rank {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "concat operands disagree on rank: {first} vs {info}"
            ));
        }
        for (dim_axis, (&a, &b)) in shape.iter().zip(info.shape().iter()).enumerate() {
            if dim_axis != axis && a != b {
                return Err(error!(
                    ErrorKind::ShapeMismatch,
                    "concat operands disagree on axis {dim_axis}: {a} vs {b}"
                ));
            }
        }
        shape[axis] += info.dim(axis);
    }
    Ok(vec![TensorInfo::new(first.dtype(), shape)])
}

fn setup_pad(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let pads = ctx.op.attrs.ints("pads")?;
    if pads.len() != 2 * input.rank() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "pad expects {} pad values for {input}, got {}",
            2 * input.rank(),
            pads.len()
        ));
    }
    let rank = input.rank();
    let shape: Vec<i64> = (0..rank)
        .map(|axis| input.dim(axis) + pads[axis] + pads[rank + axis])
        .collect();
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

fn setup_gather(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let data = ctx.in_info(0)?;
    let indices = ctx.in_info(1)?;
    let axis = normalize_axis(ctx.op.attrs.int_or("axis", 0)?, data.rank())?;
    let mut shape = data.shape()[..axis].to_vec();
    shape.extend_from_slice(indices.shape());
    shape.extend_from_slice(&data.shape()[axis + 1..]);
    Ok(vec![TensorInfo::new(data.dtype(), shape)])
}

pub(super) fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let axis = if axis < 0 { axis + rank as i64 } else { axis };
    if axis < 0 || axis >= rank as i64 {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "axis {axis} out of range for rank {rank}"
        ));
    }
    Ok(axis as usize)
}

fn grad_identity(_op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::IDENTITY,
        attrs: Attributes::new(),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_transpose(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let input = graph.tensor_info(op.input(0)?)?;
    let perm = permutation(op, input.rank())?;
    let mut inverse = vec![0i64; perm.len()];
    for (out_axis, &in_axis) in perm.iter().enumerate() {
        inverse[in_axis] = out_axis as i64;
    }
    Ok(vec![GradOpSpec {
        operator: catalog::TRANSPOSE,
        attrs: Attributes::new().with("perm", AttrValue::Ints(inverse)),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_reshape(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let input = graph.tensor_info(op.input(0)?)?;
    Ok(vec![GradOpSpec {
        operator: catalog::RESHAPE,
        attrs: Attributes::new().with("shape", AttrValue::Ints(input.shape().to_vec())),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_cast(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let input = graph.tensor_info(op.input(0)?)?;
    Ok(vec![GradOpSpec {
        operator: catalog::CAST,
        attrs: Attributes::new().with("to", AttrValue::Int(input.dtype().onnx_tag() as i64)),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_slice(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    // The gradient scatters the sliced window back into a zero tensor of
    // the input's shape, which is exactly a zero-valued Pad.
    let input = graph.tensor_info(op.input(0)?)?;
    let (starts, ends) = slice_bounds(op, input)?;
    let rank = input.rank();
    let mut pads = vec![0i64; 2 * rank];
    for axis in 0..rank {
        pads[axis] = starts[axis];
        pads[rank + axis] = input.dim(axis) - ends[axis];
    }
    Ok(vec![GradOpSpec {
        operator: catalog::PAD,
        attrs: Attributes::new()
            .with("pads", AttrValue::Ints(pads))
            .with("value", AttrValue::Float(0.0)),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_concat(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let first = graph.tensor_info(op.input(0)?)?;
    let axis = normalize_axis(op.attrs.int("axis")?, first.rank())?;
    let mut offset = 0i64;
    let mut specs = Vec::with_capacity(op.n_inputs());
    for (index, tensor) in op.inputs() {
        let info = graph.tensor_info(tensor)?;
        let extent = info.dim(axis);
        specs.push(GradOpSpec {
            operator: catalog::SLICE,
            attrs: Attributes::new()
                .with("axes", AttrValue::Ints(vec![axis as i64]))
                .with("starts", AttrValue::Ints(vec![offset]))
                .with("ends", AttrValue::Ints(vec![offset + extent])),
            grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
            grad_out_to_fwd_in: vec![(0, index)],
        });
        offset += extent;
    }
    Ok(specs)
}

fn grad_pad(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let input = graph.tensor_info(op.input(0)?)?;
    let pads = op.attrs.ints("pads")?;
    let rank = input.rank();
    let axes: Vec<i64> = (0..rank as i64).collect();
    let starts: Vec<i64> = (0..rank).map(|axis| pads[axis]).collect();
    let ends: Vec<i64> = (0..rank)
        .map(|axis| pads[axis] + input.dim(axis))
        .collect();
    Ok(vec![GradOpSpec {
        operator: catalog::SLICE,
        attrs: Attributes::new()
            .with("axes", AttrValue::Ints(axes))
            .with("starts", AttrValue::Ints(starts))
            .with("ends", AttrValue::Ints(ends)),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_gather(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let data = graph.tensor_info(op.input(0)?)?;
    let axis = normalize_axis(op.attrs.int_or("axis", 0)?, data.rank())?;
    Ok(vec![GradOpSpec {
        operator: catalog::GATHER_GRAD,
        attrs: Attributes::new()
            .with("axis", AttrValue::Int(axis as i64))
            .with("target_shape", AttrValue::Ints(data.shape().to_vec())),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::GradOfOutput),
            GradInput::new(1, 1, GradSource::Input),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn fold_copy(ctx: &FoldCtx) -> Result<Vec<u8>> {
    Ok(ctx.in_bytes(0)?.to_vec())
}

fn fold_transpose(ctx: &FoldCtx) -> Result<Vec<u8>> {
    let input = ctx.in_info(0)?;
    let perm = permutation(ctx.op, input.rank())?;
    foldutil::permute(input, &perm, ctx.in_bytes(0)?)
}

fn fold_cast(ctx: &FoldCtx) -> Result<Vec<u8>> {
    foldutil::cast(ctx.in_info(0)?, ctx.out_info.dtype(), ctx.in_bytes(0)?)
}

fn fold_slice(ctx: &FoldCtx) -> Result<Vec<u8>> {
    let input = ctx.in_info(0)?;
    let (starts, ends) = slice_bounds(ctx.op, input)?;
    let sizes: Vec<i64> = starts.iter().zip(ends.iter()).map(|(s, e)| e - s).collect();
    foldutil::slice(input, &starts, &sizes, ctx.in_bytes(0)?)
}

fn fold_concat(ctx: &FoldCtx) -> Result<Vec<u8>> {
    let axis = normalize_axis(ctx.op.attrs.int("axis")?, ctx.out_info.rank())?;
    foldutil::concat(&ctx.inputs, axis, ctx.out_info)
}
