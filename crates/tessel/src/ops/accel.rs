//! Accelerator-domain ops: pipeline plumbing (copies, stash/restore),
//! dynamic slicing, inplace variants and the SGD var-update family.

use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::ops::{catalog, Arity, OpDef, OpFlags, Registry, SetupCtx};
use crate::shape::TensorInfo;

pub(super) fn register(registry: &mut Registry) {
    registry.insert(catalog::INIT, OpDef::new(Arity::Fixed(0), 1, setup_init));
    registry.insert(
        catalog::TILE_COPY,
        OpDef::new(Arity::Fixed(1), 1, setup_like_input).flags(OpFlags {
            copy: true,
            ..OpFlags::default()
        }),
    );
    registry.insert(catalog::STASH, OpDef::new(Arity::Fixed(1), 1, setup_stash));
    registry.insert(
        catalog::RESTORE,
        OpDef::new(Arity::Fixed(2), 1, setup_restore),
    );
    registry.insert(
        catalog::RESTORE_INPLACE,
        OpDef::new(Arity::Fixed(2), 1, setup_restore)
            .modifying(&[0])
            .aliasing(&[(0, 0)]),
    );
    registry.insert(
        catalog::DYNAMIC_SLICE,
        OpDef::new(Arity::Fixed(2), 1, setup_dynamic_slice)
            .with_constraints(&[(1, &[DType::Uint32, DType::Int32])]),
    );
    registry.insert(
        catalog::DYNAMIC_UPDATE,
        OpDef::new(Arity::Fixed(3), 1, setup_like_input)
            .with_constraints(&[(1, &[DType::Uint32, DType::Int32])])
            .modifying(&[0])
            .aliasing(&[(0, 0)]),
    );
    registry.insert(
        catalog::CONCAT_INPLACE,
        OpDef::new(Arity::Variadic { min: 1 }, 1, super::shape_ops::setup_concat).flags(OpFlags {
            alias_variadic: true,
            ..OpFlags::default()
        }),
    );
    registry.insert(
        catalog::FLATTEN_INPLACE,
        OpDef::new(Arity::Fixed(1), 1, super::shape_ops::setup_flatten).aliasing(&[(0, 0)]),
    );
    registry.insert(
        catalog::RESHAPE_INPLACE,
        OpDef::new(Arity::Fixed(1), 1, super::shape_ops::setup_reshape).aliasing(&[(0, 0)]),
    );
    registry.insert(
        catalog::RELU_INPLACE,
        OpDef::new(Arity::Fixed(1), 1, setup_like_input)
            .modifying(&[0])
            .aliasing(&[(0, 0)])
            .elementwise_unary(),
    );

    let update_flags = OpFlags {
        var_update: true,
        ..OpFlags::default()
    };
    registry.insert(
        catalog::SGD0_VAR_UPDATE,
        OpDef::new(Arity::Variadic { min: 2 }, 1, setup_like_input)
            .modifying(&[0])
            .aliasing(&[(0, 0)])
            .flags(update_flags),
    );
    registry.insert(
        catalog::SGD1_ACCUMULATE,
        OpDef::new(Arity::Variadic { min: 2 }, 1, setup_like_input)
            .modifying(&[0])
            .aliasing(&[(0, 0)])
            .flags(update_flags),
    );
    registry.insert(
        catalog::SGD1_VAR_UPDATE,
        OpDef::new(Arity::Variadic { min: 2 }, 2, setup_sgd1_var_update)
            .modifying(&[0, 1])
            .aliasing(&[(0, 0), (1, 1)])
            .flags(update_flags),
    );
}

fn setup_like_input(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(0)?.clone()])
}

fn setup_init(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let dtype = DType::from_onnx_tag(ctx.op.attrs.int("dtype")? as i32)?;
    let shape = ctx.op.attrs.ints("shape")?.to_vec();
    Ok(vec![TensorInfo::new(dtype, shape)])
}

fn setup_stash(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let input = ctx.in_info(0)?;
    let stash_size = ctx.op.attrs.int("stash_size")?;
    if stash_size < 1 {
        return Err(error!(
            ErrorKind::InsufficientPipelineDepth,
            "stash of depth {stash_size} on op {}",
            ctx.op.debug_name()
        ));
    }
    let mut shape = vec![stash_size];
    shape.extend_from_slice(input.shape());
    Ok(vec![TensorInfo::new(input.dtype(), shape)])
}

fn setup_restore(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let act = ctx.in_info(0)?;
    let stash = ctx.in_info(1)?;
    if stash.rank() != act.rank() + 1 || &stash.shape()[1..] != act.shape() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "restore stash {stash} does not ring-buffer activations {act}"
        ));
    }
    Ok(vec![act.clone()])
}

fn setup_dynamic_slice(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    let data = ctx.in_info(0)?;
    let axes = ctx.op.attrs.ints("axes")?;
    let sizes = ctx.op.attrs.ints("sizes")?;
    if axes.len() != sizes.len() {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "dynamic slice axes/sizes lengths disagree on {}",
            ctx.op.debug_name()
        ));
    }
    let mut shape = data.shape().to_vec();
    for (&axis, &size) in axes.iter().zip(sizes.iter()) {
        let axis = axis as usize;
        if axis >= shape.len() || size < 1 || size > shape[axis] {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "dynamic slice of size {size} on axis {axis} of {data}"
            ));
        }
        shape[axis] = size;
    }
    Ok(vec![TensorInfo::new(data.dtype(), shape)])
}

fn setup_sgd1_var_update(ctx: &SetupCtx) -> Result<Vec<TensorInfo>> {
    Ok(vec![ctx.in_info(0)?.clone(), ctx.in_info(1)?.clone()])
}
