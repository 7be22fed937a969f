//! Arithmetic and linear-algebra ops, with their gradients and const-expr
//! kernels.

use crate::attributes::{AttrValue, Attributes};
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::op::Op;
use crate::ops::foldutil::{self, BinaryKind, FoldCtx};
use crate::ops::{
    catalog, Arity, GradInput, GradOpSpec, GradSource, OpDef, Registry, SetupCtx,
};
use crate::shape::{np_out, np_reduction_axes, TensorInfo};

pub(super) fn register(registry: &mut Registry) {
    registry.insert(
        catalog::ADD,
        OpDef::new(Arity::Fixed(2), 1, setup_binary)
            .with_grad(grad_add)
            .with_fold(|ctx| fold_binary(ctx, BinaryKind::Add))
            .shardable(),
    );
    registry.insert(
        catalog::SUB,
        OpDef::new(Arity::Fixed(2), 1, setup_binary)
            .with_grad(grad_sub)
            .with_fold(|ctx| fold_binary(ctx, BinaryKind::Sub))
            .shardable(),
    );
    registry.insert(
        catalog::MUL,
        OpDef::new(Arity::Fixed(2), 1, setup_binary)
            .with_grad(grad_mul)
            .with_fold(|ctx| fold_binary(ctx, BinaryKind::Mul))
            .shardable(),
    );
    registry.insert(
        catalog::DIV,
        OpDef::new(Arity::Fixed(2), 1, setup_binary)
            .with_grad(grad_div)
            .with_fold(|ctx| fold_binary(ctx, BinaryKind::Div))
            .shardable(),
    );
    registry.insert(
        catalog::NEG,
        OpDef::new(Arity::Fixed(1), 1, setup_unary)
            .with_grad(grad_neg)
            .with_fold(fold_neg)
            .elementwise_unary()
            .shardable(),
    );
    registry.insert(
        catalog::SQUARE,
        OpDef::new(Arity::Fixed(1), 1, setup_unary)
            .with_grad(grad_square)
            .elementwise_unary()
            .shardable(),
    );
    registry.insert(
        catalog::SCALE,
        OpDef::new(Arity::Fixed(1), 1, setup_unary)
            .with_grad(grad_scale)
            .with_fold(fold_scale)
            .elementwise_unary()
            .shardable(),
    );
    registry.insert(
        catalog::SUM,
        OpDef::new(Arity::Variadic { min: 1 }, 1, setup_sum)
            .with_grad(grad_sum)
            .shardable(),
    );
    registry.insert(
        catalog::MATMUL,
        OpDef::new(Arity::Fixed(2), 1, setup_matmul)
            .with_grad(grad_matmul)
            .shardable(),
    );
    registry.insert(
        catalog::REDUCE_SUM,
        OpDef::new(Arity::Fixed(1), 1, setup_reduce_sum).with_grad(grad_reduce_sum),
    );

    // Gradient-only ops.
    registry.insert(
        catalog::REDUCE_SUM_TO_SHAPE,
        OpDef::new(Arity::Fixed(1), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::SUB_ARG1_GRAD,
        OpDef::new(Arity::Fixed(1), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::MUL_ARG0_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::MUL_ARG1_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::DIV_ARG0_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::DIV_ARG1_GRAD,
        OpDef::new(Arity::Fixed(3), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::SQUARE_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_like_second_input),
    );
    registry.insert(
        catalog::MATMUL_LHS_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::MATMUL_RHS_GRAD,
        OpDef::new(Arity::Fixed(2), 1, setup_to_target_shape),
    );
    registry.insert(
        catalog::REDUCE_SUM_GRAD,
        OpDef::new(Arity::Fixed(1), 1, setup_to_target_shape),
    );
}

fn setup_binary(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![np_out(ctx.in_info(0)?, ctx.in_info(1)?)?])
}

fn setup_unary(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(0)?.clone()])
}

fn setup_sum(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let mut info = ctx.in_info(0)?.clone();
    for index in 1..ctx.n_inputs() {
        info = np_out(&info, ctx.in_info(index)?)?;
    }
    Ok(vec![info])
}

fn setup_matmul(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let lhs = ctx.in_info(0)?;
    let rhs = ctx.in_info(1)?;
    if lhs.dtype() != rhs.dtype() {
        return Err(error!(
            ErrorKind::TypeMismatch,
            "matmul operands have element types {} and {}",
            lhs.dtype().onnx_name(),
            rhs.dtype().onnx_name()
        ));
    }
    if lhs.rank() < 2 || rhs.rank() < 2 {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "matmul requires rank >= 2 operands, got {lhs} and {rhs}"
        ));
    }
    let (m, k_lhs) = (lhs.dim(lhs.rank() - 2), lhs.dim(lhs.rank() - 1));
    let (k_rhs, n) = (rhs.dim(rhs.rank() - 2), rhs.dim(rhs.rank() - 1));
    if k_lhs != k_rhs {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "matmul contraction mismatch: {lhs} x {rhs}"
        ));
    }
    let batch = crate::shape::np_out_shape(
        &lhs.shape()[..lhs.rank() - 2],
        &rhs.shape()[..rhs.rank() - 2],
    )?;
    let mut shape = batch;
    shape.push(m);
    shape.push(n);
    Ok(vec![TensorInfo::new(lhs.dtype(), shape)])
}

fn setup_reduce_sum(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let keepdims = ctx.op.attrs.int_or("keepdims", 1)? != 0;
    let axes = normalized_axes(ctx.op, input.rank())?;
    let mut shape = Vec::new();
    for (axis, &dim) in input.shape().iter().enumerate() {
        if axes.contains(&(axis as i64)) {
            if keepdims {
                shape.push(1);
            }
        } else {
            shape.push(dim);
        }
    }
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

fn normalized_axes(op: &Op, rank: usize) -> Result<Vec<i64>> {
    let raw = op.attrs.ints_or_empty("axes")?;
    if raw.is_empty() {
        return Ok((0..rank as i64).collect());
    }
    raw.iter()
        .map(|&axis| {
            let axis = if axis < 0 { axis + rank as i64 } else { axis };
            if axis < 0 || axis >= rank as i64 {
                Err(error!(
                    ErrorKind::ShapeMismatch,
                    "reduction axis {axis} out of range for rank {rank}"
                ))
            } else {
                Ok(axis)
            }
        })
        .collect()
}

/// Grad ops whose output shape is an explicit attribute; the element type
/// follows the incoming gradient.
pub(super) fn setup_to_target_shape(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let shape = ctx.op.attrs.ints("target_shape")?.to_vec();
    Ok(vec![TensorInfo::new(ctx.in_dtype(0)?, shape)])
}

fn setup_like_second_input(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(1)?.clone()])
}

fn reduce_to_shape_attrs(arg: &TensorInfo, out: &TensorInfo) -> Attributes {
    Attributes::new()
        .with(
            "axes",
            AttrValue::Ints(np_reduction_axes(arg.shape(), out.shape())),
        )
        .with("target_shape", AttrValue::Ints(arg.shape().to_vec()))
}

fn grad_add(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let out = graph.tensor_info(op.output(0)?)?;
    let mut specs = Vec::with_capacity(2);
    for arg in 0..2 {
        let input = graph.tensor_info(op.input(arg)?)?;
        specs.push(GradOpSpec {
            operator: catalog::REDUCE_SUM_TO_SHAPE,
            attrs: reduce_to_shape_attrs(input, out),
            grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
            grad_out_to_fwd_in: vec![(0, arg)],
        });
    }
    Ok(specs)
}

fn grad_sub(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let out = graph.tensor_info(op.output(0)?)?;
    let arg0 = graph.tensor_info(op.input(0)?)?;
    let arg1 = graph.tensor_info(op.input(1)?)?;
    Ok(vec![
        GradOpSpec {
            operator: catalog::REDUCE_SUM_TO_SHAPE,
            attrs: reduce_to_shape_attrs(arg0, out),
            grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
            grad_out_to_fwd_in: vec![(0, 0)],
        },
        GradOpSpec {
            operator: catalog::SUB_ARG1_GRAD,
            attrs: reduce_to_shape_attrs(arg1, out),
            grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
            grad_out_to_fwd_in: vec![(0, 1)],
        },
    ])
}

fn grad_mul(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let out = graph.tensor_info(op.output(0)?)?;
    let arg0 = graph.tensor_info(op.input(0)?)?;
    let arg1 = graph.tensor_info(op.input(1)?)?;
    Ok(vec![
        GradOpSpec {
            operator: catalog::MUL_ARG0_GRAD,
            attrs: reduce_to_shape_attrs(arg0, out),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 1, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 0)],
        },
        GradOpSpec {
            operator: catalog::MUL_ARG1_GRAD,
            attrs: reduce_to_shape_attrs(arg1, out),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 0, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 1)],
        },
    ])
}

fn grad_div(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let out = graph.tensor_info(op.output(0)?)?;
    let arg0 = graph.tensor_info(op.input(0)?)?;
    let arg1 = graph.tensor_info(op.input(1)?)?;
    Ok(vec![
        GradOpSpec {
            operator: catalog::DIV_ARG0_GRAD,
            attrs: reduce_to_shape_attrs(arg0, out),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 1, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 0)],
        },
        GradOpSpec {
            operator: catalog::DIV_ARG1_GRAD,
            attrs: reduce_to_shape_attrs(arg1, out),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 0, GradSource::Input),
                GradInput::new(2, 1, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 1)],
        },
    ])
}

fn grad_neg(_op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    Ok(vec![GradOpSpec {
        operator: catalog::NEG,
        attrs: Attributes::new(),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_square(_op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    // d/dx x^2 = 2x, applied to the incoming gradient.
    Ok(vec![GradOpSpec {
        operator: catalog::SQUARE_GRAD,
        attrs: Attributes::new(),
        grad_inputs: vec![
            GradInput::new(0, 0, GradSource::GradOfOutput),
            GradInput::new(1, 0, GradSource::Input),
        ],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_scale(op: &Op, _graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let factor = op.attrs.float("scale")?;
    Ok(vec![GradOpSpec {
        operator: catalog::SCALE,
        attrs: Attributes::new().with("scale", AttrValue::Float(factor)),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn grad_sum(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let out = graph.tensor_info(op.output(0)?)?;
    let mut specs = Vec::with_capacity(op.n_inputs());
    for (index, tensor) in op.inputs() {
        let input = graph.tensor_info(tensor)?;
        specs.push(GradOpSpec {
            operator: catalog::REDUCE_SUM_TO_SHAPE,
            attrs: reduce_to_shape_attrs(input, out),
            grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
            grad_out_to_fwd_in: vec![(0, index)],
        });
    }
    Ok(specs)
}

fn grad_matmul(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let lhs = graph.tensor_info(op.input(0)?)?;
    let rhs = graph.tensor_info(op.input(1)?)?;
    Ok(vec![
        GradOpSpec {
            operator: catalog::MATMUL_LHS_GRAD,
            attrs: Attributes::new().with("target_shape", AttrValue::Ints(lhs.shape().to_vec())),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 1, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 0)],
        },
        GradOpSpec {
            operator: catalog::MATMUL_RHS_GRAD,
            attrs: Attributes::new().with("target_shape", AttrValue::Ints(rhs.shape().to_vec())),
            grad_inputs: vec![
                GradInput::new(0, 0, GradSource::GradOfOutput),
                GradInput::new(1, 0, GradSource::Input),
            ],
            grad_out_to_fwd_in: vec![(0, 1)],
        },
    ])
}

fn grad_reduce_sum(op: &Op, graph: &Graph) -> Result<Vec<GradOpSpec>> {
    let input = graph.tensor_info(op.input(0)?)?;
    Ok(vec![GradOpSpec {
        operator: catalog::REDUCE_SUM_GRAD,
        attrs: Attributes::new().with("target_shape", AttrValue::Ints(input.shape().to_vec())),
        grad_inputs: vec![GradInput::new(0, 0, GradSource::GradOfOutput)],
        grad_out_to_fwd_in: vec![(0, 0)],
    }])
}

fn fold_binary(ctx: &FoldCtx, kind: BinaryKind) -> Result<Vec<u8>> {
    foldutil::binary(
        kind,
        (ctx.in_info(0)?, ctx.in_bytes(0)?),
        (ctx.in_info(1)?, ctx.in_bytes(1)?),
        ctx.out_info,
    )
}

fn fold_neg(ctx: &FoldCtx) -> Result<Vec<u8>> {
    foldutil::negate(ctx.in_info(0)?, ctx.in_bytes(0)?)
}

fn fold_scale(ctx: &FoldCtx) -> Result<Vec<u8>> {
    let factor = ctx.op.attrs.float("scale")?;
    foldutil::scale(ctx.in_info(0)?, factor, ctx.in_bytes(0)?)
}
