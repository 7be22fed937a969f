//! Byte-level evaluation helpers shared by the const-expr kernels.

use half::f16;

use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::op::Op;
use crate::shape::TensorInfo;

/// Inputs and expected output of one const-expr kernel invocation.
pub struct FoldCtx<'a> {
    pub op: &'a Op,
    /// Input infos and buffers in input-index order.
    pub inputs: Vec<(&'a TensorInfo, &'a [u8])>,
    pub out_info: &'a TensorInfo,
}

impl<'a> FoldCtx<'a> {
    pub fn in_info(&self, index: usize) -> Result<&TensorInfo> {
        self.inputs
            .get(index)
            .map(|(info, _)| *info)
            .ok_or_else(|| Error::missing_input(self.op, index))
    }

    pub fn in_bytes(&self, index: usize) -> Result<&[u8]> {
        self.inputs
            .get(index)
            .map(|(_, bytes)| *bytes)
            .ok_or_else(|| Error::missing_input(self.op, index))
    }
}

use crate::error::Error;

impl Error {
    fn missing_input(op: &Op, index: usize) -> Error {
        Error::internal(format!(
            "const-expr kernel for {} is missing input {index}",
            op.debug_name()
        ))
    }
}

pub fn elem_size(info: &TensorInfo) -> Result<usize> {
    info.dtype().size_in_bytes().ok_or_else(|| {
        error!(
            ErrorKind::TypeMismatch,
            "cannot evaluate variable-width element type {}",
            info.dtype().onnx_name()
        )
    })
}

/// Row-major strides in elements.
fn strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

fn unravel(mut linear: i64, shape: &[i64]) -> Vec<i64> {
    let strides = strides(shape);
    shape
        .iter()
        .zip(strides.iter())
        .map(|(&dim, &stride)| {
            let index = (linear / stride) % dim;
            linear %= stride;
            index
        })
        .collect()
}

/// Permutes the elements of `bytes` per `perm` (output axis -> input axis).
pub fn permute(info: &TensorInfo, perm: &[usize], bytes: &[u8]) -> Result<Vec<u8>> {
    let size = elem_size(info)?;
    let in_shape = info.shape();
    let out_shape: Vec<i64> = perm.iter().map(|&axis| in_shape[axis]).collect();
    let in_strides = strides(in_shape);
    let mut out = vec![0u8; bytes.len()];
    for linear in 0..info.nelms() {
        let out_index = unravel(linear, &out_shape);
        let mut in_linear = 0i64;
        for (out_axis, &in_axis) in perm.iter().enumerate() {
            in_linear += out_index[out_axis] * in_strides[in_axis];
        }
        let src = in_linear as usize * size;
        let dst = linear as usize * size;
        out[dst..dst + size].copy_from_slice(&bytes[src..src + size]);
    }
    Ok(out)
}

/// Copies the rectangle `[starts, starts+sizes)` out of `bytes`.
pub fn slice(info: &TensorInfo, starts: &[i64], sizes: &[i64], bytes: &[u8]) -> Result<Vec<u8>> {
    let size = elem_size(info)?;
    let in_strides = strides(info.shape());
    let nelms: i64 = sizes.iter().product();
    let mut out = Vec::with_capacity(nelms as usize * size);
    for linear in 0..nelms {
        let out_index = unravel(linear, sizes);
        let mut in_linear = 0i64;
        for axis in 0..sizes.len() {
            in_linear += (starts[axis] + out_index[axis]) * in_strides[axis];
        }
        let src = in_linear as usize * size;
        out.extend_from_slice(&bytes[src..src + size]);
    }
    Ok(out)
}

/// Concatenates input buffers along `axis` into `out_info`'s shape.
pub fn concat(
    inputs: &[(&TensorInfo, &[u8])],
    axis: usize,
    out_info: &TensorInfo,
) -> Result<Vec<u8>> {
    let size = elem_size(out_info)?;
    let out_shape = out_info.shape();
    // Number of element blocks before the axis, and block length after it.
    let outer: i64 = out_shape[..axis].iter().product();
    let inner: i64 = out_shape[axis + 1..].iter().product();
    let mut out = Vec::with_capacity(out_info.nelms() as usize * size);
    for block in 0..outer {
        for (info, bytes) in inputs {
            let span = info.dim(axis) * inner;
            let start = (block * span) as usize * size;
            let end = start + span as usize * size;
            out.extend_from_slice(&bytes[start..end]);
        }
    }
    Ok(out)
}

/// Scalar value lifted out of (or pushed into) a raw buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    F64(f64),
    I64(i64),
    U64(u64),
}

impl Scalar {
    fn as_f64(self) -> f64 {
        match self {
            Scalar::F64(v) => v,
            Scalar::I64(v) => v as f64,
            Scalar::U64(v) => v as f64,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Scalar::F64(v) => v as i64,
            Scalar::I64(v) => v,
            Scalar::U64(v) => v as i64,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Scalar::F64(v) => v as u64,
            Scalar::I64(v) => v as u64,
            Scalar::U64(v) => v,
        }
    }
}

fn read_scalar(dtype: DType, bytes: &[u8], index: usize) -> Result<Scalar> {
    let value = match dtype {
        DType::Float32 => Scalar::F64(f32::from_le_bytes(array4(bytes, index * 4)) as f64),
        DType::Float16 => Scalar::F64(
            f16::from_le_bytes([bytes[index * 2], bytes[index * 2 + 1]]).to_f64(),
        ),
        DType::Int8 => Scalar::I64(bytes[index] as i8 as i64),
        DType::Int16 => Scalar::I64(i16::from_le_bytes(array2(bytes, index * 2)) as i64),
        DType::Int32 => Scalar::I64(i32::from_le_bytes(array4(bytes, index * 4)) as i64),
        DType::Int64 => Scalar::I64(i64::from_le_bytes(array8(bytes, index * 8))),
        DType::Uint8 => Scalar::U64(bytes[index] as u64),
        DType::Uint16 => Scalar::U64(u16::from_le_bytes(array2(bytes, index * 2)) as u64),
        DType::Uint32 => Scalar::U64(u32::from_le_bytes(array4(bytes, index * 4)) as u64),
        DType::Uint64 => Scalar::U64(u64::from_le_bytes(array8(bytes, index * 8))),
        DType::Bool => Scalar::U64((bytes[index] != 0) as u64),
        other => {
            return Err(error!(
                ErrorKind::TypeMismatch,
                "cannot read scalars of element type {}",
                other.onnx_name()
            ))
        }
    };
    Ok(value)
}

fn write_scalar(dtype: DType, value: Scalar, out: &mut Vec<u8>) -> Result<()> {
    match dtype {
        DType::Float32 => out.extend_from_slice(&(value.as_f64() as f32).to_le_bytes()),
        DType::Float16 => {
            out.extend_from_slice(&f16::from_f64(value.as_f64()).to_le_bytes())
        }
        DType::Int8 => out.push(value.as_i64() as i8 as u8),
        DType::Int16 => out.extend_from_slice(&(value.as_i64() as i16).to_le_bytes()),
        DType::Int32 => out.extend_from_slice(&(value.as_i64() as i32).to_le_bytes()),
        DType::Int64 => out.extend_from_slice(&value.as_i64().to_le_bytes()),
        DType::Uint8 => out.push(value.as_u64() as u8),
        DType::Uint16 => out.extend_from_slice(&(value.as_u64() as u16).to_le_bytes()),
        DType::Uint32 => out.extend_from_slice(&(value.as_u64() as u32).to_le_bytes()),
        DType::Uint64 => out.extend_from_slice(&value.as_u64().to_le_bytes()),
        DType::Bool => out.push((value.as_u64() != 0) as u8),
        other => {
            return Err(error!(
                ErrorKind::TypeMismatch,
                "cannot write scalars of element type {}",
                other.onnx_name()
            ))
        }
    }
    Ok(())
}

/// Reinterprets `bytes` of `from` dtype as `to` dtype, numeric-converting
/// element by element.
pub fn cast(from: &TensorInfo, to: DType, bytes: &[u8]) -> Result<Vec<u8>> {
    let n = from.nelms() as usize;
    let out_size = to
        .size_in_bytes()
        .ok_or_else(|| error!(ErrorKind::TypeMismatch, "cannot cast to {}", to.onnx_name()))?;
    let mut out = Vec::with_capacity(n * out_size);
    for index in 0..n {
        let value = read_scalar(from.dtype(), bytes, index)?;
        write_scalar(to, value, &mut out)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

/// Elementwise binary evaluation with numpy broadcasting.
pub fn binary(
    kind: BinaryKind,
    lhs: (&TensorInfo, &[u8]),
    rhs: (&TensorInfo, &[u8]),
    out_info: &TensorInfo,
) -> Result<Vec<u8>> {
    let dtype = out_info.dtype();
    let out_shape = out_info.shape();
    let mut out = Vec::with_capacity(
        out_info.nelms() as usize * elem_size(out_info)?,
    );
    for linear in 0..out_info.nelms() {
        let index = unravel(linear, out_shape);
        let a = read_scalar(dtype, lhs.1, broadcast_linear(&index, out_shape, lhs.0.shape()))?;
        let b = read_scalar(dtype, rhs.1, broadcast_linear(&index, out_shape, rhs.0.shape()))?;
        let value = match (dtype.is_floating_point(), kind) {
            (true, BinaryKind::Add) => Scalar::F64(a.as_f64() + b.as_f64()),
            (true, BinaryKind::Sub) => Scalar::F64(a.as_f64() - b.as_f64()),
            (true, BinaryKind::Mul) => Scalar::F64(a.as_f64() * b.as_f64()),
            (true, BinaryKind::Div) => Scalar::F64(a.as_f64() / b.as_f64()),
            (false, BinaryKind::Add) => Scalar::I64(a.as_i64().wrapping_add(b.as_i64())),
            (false, BinaryKind::Sub) => Scalar::I64(a.as_i64().wrapping_sub(b.as_i64())),
            (false, BinaryKind::Mul) => Scalar::I64(a.as_i64().wrapping_mul(b.as_i64())),
            (false, BinaryKind::Div) => {
                let divisor = b.as_i64();
                if divisor == 0 {
                    return Err(error!(
                        ErrorKind::InternalLogicError,
                        "integer division by zero while folding constants"
                    ));
                }
                Scalar::I64(a.as_i64() / divisor)
            }
        };
        write_scalar(dtype, value, &mut out)?;
    }
    Ok(out)
}

/// Elementwise negate.
pub fn negate(info: &TensorInfo, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    for index in 0..info.nelms() as usize {
        let value = read_scalar(info.dtype(), bytes, index)?;
        let negated = if info.dtype().is_floating_point() {
            Scalar::F64(-value.as_f64())
        } else {
            Scalar::I64(value.as_i64().wrapping_neg())
        };
        write_scalar(info.dtype(), negated, &mut out)?;
    }
    Ok(out)
}

/// Elementwise scale by a host float.
pub fn scale(info: &TensorInfo, factor: f32, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    for index in 0..info.nelms() as usize {
        let value = read_scalar(info.dtype(), bytes, index)?;
        write_scalar(
            info.dtype(),
            Scalar::F64(value.as_f64() * factor as f64),
            &mut out,
        )?;
    }
    Ok(out)
}

/// Maps an output multi-index to the linear index of a (possibly broadcast)
/// input of shape `in_shape`.
fn broadcast_linear(out_index: &[i64], out_shape: &[i64], in_shape: &[i64]) -> usize {
    let pad = out_shape.len() - in_shape.len();
    let in_strides = strides(in_shape);
    let mut linear = 0i64;
    for (axis, &dim) in in_shape.iter().enumerate() {
        let index = if dim == 1 { 0 } else { out_index[pad + axis] };
        linear += index * in_strides[axis];
    }
    linear as usize
}

fn array2(bytes: &[u8], at: usize) -> [u8; 2] {
    [bytes[at], bytes[at + 1]]
}

fn array4(bytes: &[u8], at: usize) -> [u8; 4] {
    [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
}

fn array8(bytes: &[u8], at: usize) -> [u8; 8] {
    [
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
        bytes[at + 4],
        bytes[at + 5],
        bytes[at + 6],
        bytes[at + 7],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn i32_values(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn permute_transposes_row_major_data() {
        let info = TensorInfo::new(DType::Int32, vec![2, 5]);
        let bytes = i32_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let out = permute(&info, &[1, 0], &bytes).unwrap();
        assert_eq!(i32_values(&out), vec![1, 6, 2, 7, 3, 8, 4, 9, 5, 10]);
    }

    #[test]
    fn slice_extracts_a_rectangle() {
        let info = TensorInfo::new(DType::Int32, vec![2, 3]);
        let bytes = i32_bytes(&[1, 2, 3, 4, 5, 6]);
        let out = slice(&info, &[0, 1], &[2, 2], &bytes).unwrap();
        assert_eq!(i32_values(&out), vec![2, 3, 5, 6]);
    }

    #[test]
    fn concat_joins_along_axis() {
        let a = TensorInfo::new(DType::Int32, vec![2, 1]);
        let b = TensorInfo::new(DType::Int32, vec![2, 2]);
        let out_info = TensorInfo::new(DType::Int32, vec![2, 3]);
        let a_bytes = i32_bytes(&[1, 2]);
        let b_bytes = i32_bytes(&[3, 4, 5, 6]);
        let out = concat(
            &[(&a, a_bytes.as_slice()), (&b, b_bytes.as_slice())],
            1,
            &out_info,
        )
        .unwrap();
        assert_eq!(i32_values(&out), vec![1, 3, 4, 2, 5, 6]);
    }

    #[test]
    fn binary_broadcasts_and_computes() {
        let lhs = TensorInfo::new(DType::Int32, vec![2, 2]);
        let rhs = TensorInfo::new(DType::Int32, vec![1]);
        let out_info = TensorInfo::new(DType::Int32, vec![2, 2]);
        let out = binary(
            BinaryKind::Add,
            (&lhs, i32_bytes(&[1, 2, 3, 4]).as_slice()),
            (&rhs, i32_bytes(&[10]).as_slice()),
            &out_info,
        )
        .unwrap();
        assert_eq!(i32_values(&out), vec![11, 12, 13, 14]);
    }

    #[test]
    fn cast_converts_numerics() {
        let info = TensorInfo::new(DType::Int32, vec![3]);
        let out = cast(&info, DType::Float32, &i32_bytes(&[1, -2, 3])).unwrap();
        let floats: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, vec![1.0, -2.0, 3.0]);
    }
}
