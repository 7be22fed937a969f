//! Neural-network ops: activations, softmax, convolution, top-k and the
//! first-class loss ops with their gradients.

use crate::attributes::{AttrValue, Attributes};
use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::loss::Reduction;
use crate::op::Op;
use crate::ops::shape_ops::normalize_axis;
use crate::ops::{
    catalog, Arity, GradInput, GradOpSpec, GradSource, InplaceVariant, OpDef, OpFlags, Registry,
    SetupCtx,
};
use crate::shape::TensorInfo;

pub(super) fn register(registry: &mut Registry) {
    registry.insert(
        catalog::RELU,
        OpDef::new(Arity::Fixed(1), 1, setup_unary)
            .with_grad(grad_relu)
            .with_inplace(|_| {
                vec![InplaceVariant {
                    operator: catalog::RELU_INPLACE,
                    priority: 10.0,
                }]
            })
            .elementwise_unary()
            .shardable(),
    );
    registry.insert(
        catalog::RELU_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_unary),
    );
    registry.insert(
        catalog::SOFTMAX,
        OpDef::new(Arity::Fixed(1), 1, setup_softmax)
            .with_grad(grad_softmax)
            .shardable(),
    );
    registry.insert(
        catalog::SOFTMAX_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_unary),
    );
    registry.insert(
        catalog::SOFTMAX_GRAD_DIRECT,
        OpDef::new(Arity::Fixed(2), 1, setup_unary),
    );
    registry.insert(
        catalog::BATCH_NORM,
        OpDef::new(Arity::Fixed(5), 1, setup_batch_norm).flags(OpFlags {
            norm: true,
            ..OpFlags::default()
        }),
    );
    registry.insert(
        catalog::CONV,
        OpDef::new(Arity::Fixed(2), 1, setup_conv).with_grad(grad_conv),
    );
    registry.insert(
        catalog::CONV_DATA_GRAD,
        OpDef::new(Arity::Fixed(2), 1, super::math::setup_to_target_shape),
    );
    registry.insert(
        catalog::CONV_WEIGHTS_GRAD,
        OpDef::new(Arity::Fixed(2), 1, super::math::setup_to_target_shape),
    );
    registry.insert(
        catalog::TOPK,
        OpDef::new(Arity::Fixed(1), 2, setup_topk).with_grad(grad_topk),
    );
    registry.insert(
        catalog::TOPK_GRAD,
        OpDef::new(Arity::Fixed(2), 1, super::math::setup_to_target_shape),
    );

    let loss_flags = OpFlags {
        loss: true,
        ..OpFlags::default()
    };
    registry.insert(
        catalog::L1,
        OpDef::new(Arity::Fixed(1), 1, setup_reducing_loss)
            .with_grad(grad_l1)
            .flags(loss_flags),
    );
    registry.insert(
        catalog::L1_GRAD,
        OpDef::new(Arity::Fixed(1), 1, setup_unary),
    );
    registry.insert(
        catalog::NLL,
        OpDef::new(Arity::Fixed(2), 1, setup_nll)
            .with_constraints(&[(1, &[DType::Int32, DType::Int64])])
            .with_grad(grad_nll)
            .flags(loss_flags),
    );
    registry.insert(
        catalog::NLL_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_unary),
    );
    registry.insert(
        catalog::IDENTITY_LOSS,
        OpDef::new(Arity::Fixed(1), 1, setup_reducing_loss)
            .with_grad(grad_identity_loss)
            .flags(loss_flags),
    );
    registry.insert(
        catalog::IDENTITY_LOSS_GRAD,
        OpDef::new(Arity::Fixed(1), 1, setup_unary),
    );
}

fn setup_unary(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(0)?.clone()])
}

fn setup_softmax(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    normalize_axis(ctx.op.attrs.int_or("axis", 1)?, input.rank())?;
    Ok(vec![input.clone()])
}

fn setup_batch_norm(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    if input.rank() < 2 {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "batch normalization requires a channel axis, got {input}"
        ));
    }
    let channels = input.dim(1);
    for index in 1..5 {
        let param = ctx.in_info(index)?;
        if param.shape() != [channels] {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "batch normalization parameter {index} has shape {param}, expected [{channels}]"
            ));
        }
    }
    Ok(vec![input.clone()])
}

fn setup_conv(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let data = ctx.in_info(0)?;
    let weights = ctx.in_info(1)?;
    if data.rank() < 3 || weights.rank() != data.rank() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "conv expects [N, C, spatial...] data and matching-rank weights, got {data} and {weights}"
        ));
    }
    let spatial = data.rank() - 2;
    let group = ctx.op.attrs.int_or("group", 1)?;
    if weights.dim(1) * group != data.dim(1) {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "conv channel mismatch: {data} with {weights} at group {group}"
        ));
    }
    let strides = ints_or(ctx.op, "strides", spatial, 1)?;
    let dilations = ints_or(ctx.op, "dilations", spatial, 1)?;
    let pads = ints_or(ctx.op, "pads", 2 * spatial, 0)?;
    let mut shape = vec![data.dim(0), weights.dim(0)];
    for axis in 0..spatial {
        let input = data.dim(2 + axis);
        let kernel = weights.dim(2 + axis);
        let padded = input + pads[axis] + pads[spatial + axis];
        let window = dilations[axis] * (kernel - 1) + 1;
        if padded < window {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "conv window exceeds padded input on spatial axis {axis}"
            ));
        }
        shape.push((padded - window) / strides[axis] + 1);
    }
    Ok(vec![TensorInfo::new(data.dtype(), shape)])
}

fn ints_or(op: &Op, name: &str, len: usize, default: i64) -> Result<Vec<i64>> {
    let raw = op.attrs.ints_or_empty(name)?;
    if raw.is_empty() {
        return Ok(vec![default; len]);
    }
    if raw.len() != len {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "attribute {name} has {} values, expected {len}",
            raw.len()
        ));
    }
    Ok(raw.to_vec())
}

fn setup_topk(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let axis = normalize_axis(ctx.op.attrs.int_or("axis", -1)?, input.rank())?;
    let k = ctx.op.attrs.int("k")?;
    if k < 1 || k > input.dim(axis) {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "top-k with k={k} out of range for axis {axis} of {input}"
        ));
    }
    let mut shape = input.shape().to_vec();
    shape[axis] = k;
    Ok(vec![
        TensorInfo::new(input.dtype(), shape.clone()),
        TensorInfo::new(DType::Int64, shape),
    ])
}

/// Losses with a Sum/Mean reduction produce a scalar; with no reduction the
/// per-sample losses keep the input shape.
fn setup_reducing_loss(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let shape = match reduction_attr(ctx.op)? {
        Reduction::None => input.shape().to_vec(),
        Reduction::Sum | Reduction::Mean => vec![],
    };
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

fn setup_nll(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let probs = ctx.in_info(0)?;
    let labels = ctx.in_info(1)?;
    if probs.rank() < 2 || labels.shape() != &probs.shape()[..probs.rank() - 1] {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "nll expects probabilities [*, C] with labels [*], got {probs} and {labels}"
        ));
    }
    let shape = match reduction_attr(ctx.op)? {
        Reduction::None => labels.shape().to_vec(),
        Reduction::Sum | Reduction::Mean => vec![],
    };
    Ok(vec![TensorInfo::new(probs.dtype(), shape)])
}

pub(crate) fn reduction_attr(op: &Op) -> Result<Reduction> {
    Reduction::from_name(op.attrs.string("reduction")?)
}

fn grad_relu(_op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::RELU_GRAD,
        attrs: Attributes::new(),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::GradOfOutput),
            GradInput::new(1, 0, GradSource::Output),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_softmax(op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let axis = op.attrs.int_or("axis", 1)?;
    Ok(vec![GradOpSpec {
        operator: catalog::SOFTMAX_GRAD,
        attrs: Attributes::new().with("axis", AttrValue::Int(axis)),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::GradOfOutput),
            GradInput::new(1, 0, GradSource::Output),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_conv(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let data = graph.tensor_info(op.input(0)?)?;
    let weights = graph.tensor_info(op.input(1)?)?;
    let carried = op.attrs.clone();
    Ok(vec![
        GradOpSpec {
            operator: catalog::CONV_DATA_GRAD,
            attrs: carried
                .clone()
                .with("target_shape", AttrValue::Ints(data.shape().to_vec())),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 1, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 0)],
        },
        GradOpSpec {
            operator: catalog::CONV_WEIGHTS_GRAD,
            attrs: carried.with("target_shape", AttrValue::Ints(weights.shape().to_vec())),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 0, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 1)],
        },
    ])
}

fn grad_topk(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    // Only the values output is differentiable; the gradient scatters the
    // incoming values-gradient back to the selected positions.
    let input = graph.tensor_info(op.input(0)?)?;
    let axis = normalize_axis(op.attrs.int_or("axis", -1)?, input.rank())?;
    Ok(vec![GradOpSpec {
        operator: catalog::TOPK_GRAD,
        attrs: Attributes::new()
            .with("axis", AttrValue::Int(axis as i64))
            .with("target_shape", AttrValue::Ints(input.shape().to_vec())),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::GradOfOutput),
            GradInput::new(1, 1, GradSource::Output),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_l1(op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::L1_GRAD,
        attrs: op.attrs.clone(),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::Input)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_nll(op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::NLL_GRAD,
        attrs: op.attrs.clone(),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::Input),
            GradInput::new(1, 1, GradSource::Input),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_identity_loss(op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::IDENTITY_LOSS_GRAD,
        attrs: op.attrs.clone(),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::Input)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}
