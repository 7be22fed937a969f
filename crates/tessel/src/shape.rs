//! Tensor metadata and the numpy broadcast/reduction shape rules.

use std::fmt;

use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};

pub type Shape = Vec<i64>;

/// Element type plus ordered extents. The info of a tensor never changes
/// after it has been set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    dtype: DType,
    shape: Shape,
}

impl TensorInfo {
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        TensorInfo {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, axis: usize) -> i64 {
        self.shape[axis]
    }

    /// Total number of elements.
    pub fn nelms(&self) -> i64 {
        self.shape.iter().product()
    }

    /// Total byte size, or `None` for variable-width element types.
    pub fn nbytes(&self) -> Option<i64> {
        self.dtype
            .size_in_bytes()
            .map(|b| self.nelms() * b as i64)
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype.onnx_name(), self.shape)
    }
}

/// Numpy broadcast of two shapes: right-align, pad the shorter with leading
/// ones, then take the elementwise max where one side is 1 or both agree.
///
/// ```text
/// np_out_shape([1, 4, 5], [2, 3, 1, 1]) == [2, 3, 4, 5]
/// ```
pub fn np_out_shape(s0: &[i64], s1: &[i64]) -> Result<Shape> {
    let rank = s0.len().max(s1.len());
    let mut result = Vec::with_capacity(rank);
    for axis in 0..rank {
        let a = dim_or_one(s0, rank, axis);
        let b = dim_or_one(s1, rank, axis);
        if a == b || a == 1 || b == 1 {
            result.push(a.max(b));
        } else {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "np broadcasting failed, frames are not aligned: {s0:?} vs {s1:?}"
            ));
        }
    }
    Ok(result)
}

/// Broadcast of two tensor infos; the element types must agree.
pub fn np_out(i0: &TensorInfo, i1: &TensorInfo) -> Result<TensorInfo> {
    if i0.dtype() != i1.dtype() {
        return Err(error!(
            ErrorKind::TypeMismatch,
            "np broadcasting failed, incompatible types {} and {}",
            i0.dtype().onnx_name(),
            i1.dtype().onnx_name()
        ));
    }
    Ok(TensorInfo::new(i0.dtype(), np_out_shape(i0.shape(), i1.shape())?))
}

/// The sorted axes which must be summed over to reduce a tensor of shape
/// `out` back to shape `into`, after `into` was broadcast up to `out`.
///
/// ```text
/// np_reduction_axes([1, 4, 5], [2, 3, 4, 5]) == [0, 1]
/// ```
pub fn np_reduction_axes(into: &[i64], out: &[i64]) -> Vec<i64> {
    let prefix = out.len() - into.len();
    let mut axes: Vec<i64> = (0..prefix as i64).collect();
    for (i, &dim) in into.iter().enumerate() {
        if dim != out[prefix + i] {
            axes.push((prefix + i) as i64);
        }
    }
    axes
}

fn dim_or_one(shape: &[i64], rank: usize, axis: usize) -> i64 {
    let pad = rank - shape.len();
    if axis < pad {
        1
    } else {
        shape[axis - pad]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_pads_and_maxes() {
        assert_eq!(np_out_shape(&[1, 4, 5], &[2, 3, 1, 1]).unwrap(), [2, 3, 4, 5]);
        assert_eq!(np_out_shape(&[5], &[3, 1]).unwrap(), [3, 5]);
        assert_eq!(np_out_shape(&[], &[2, 2]).unwrap(), [2, 2]);
    }

    #[test]
    fn broadcast_is_commutative_and_associative() {
        let shapes: [&[i64]; 3] = [&[1, 4, 5], &[2, 3, 1, 1], &[3, 4, 1]];
        for a in shapes {
            for b in shapes {
                let ab = np_out_shape(a, b).unwrap();
                let ba = np_out_shape(b, a).unwrap();
                assert_eq!(ab, ba);
                for c in shapes {
                    let left = np_out_shape(&np_out_shape(a, b).unwrap(), c).unwrap();
                    let right = np_out_shape(a, &np_out_shape(b, c).unwrap()).unwrap();
                    assert_eq!(left, right);
                }
            }
        }
    }

    #[test]
    fn incompatible_dims_fail() {
        let err = np_out_shape(&[2, 5], &[2, 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn reduction_axes_examples() {
        assert_eq!(np_reduction_axes(&[1, 4, 5], &[2, 3, 4, 5]), [0, 1]);
        assert_eq!(np_reduction_axes(&[4, 5], &[4, 5]), Vec::<i64>::new());
        assert_eq!(np_reduction_axes(&[], &[3, 2]), [0, 1]);
        assert_eq!(np_reduction_axes(&[1], &[7]), [0]);
    }

    #[test]
    fn reduction_round_trips_through_broadcast() {
        // Reducing the broadcast result over np_reduction_axes(a, out) and
        // keeping collapsed axes as 1 reproduces a shape broadcastable back
        // to `a` with the same rank alignment.
        let a: &[i64] = &[1, 4, 5];
        let b: &[i64] = &[2, 3, 1, 5];
        let out = np_out_shape(a, b).unwrap();
        let axes = np_reduction_axes(a, &out);
        let mut reduced = out.clone();
        for &axis in &axes {
            reduced[axis as usize] = 1;
        }
        let prefix = out.len() - a.len();
        assert_eq!(&reduced[prefix..], a);
        assert!(reduced[..prefix].iter().all(|&d| d == 1));
    }

    #[test]
    fn info_byte_sizes() {
        let info = TensorInfo::new(DType::Int32, vec![2, 5]);
        assert_eq!(info.nelms(), 10);
        assert_eq!(info.nbytes(), Some(40));
        let strings = TensorInfo::new(DType::String, vec![3]);
        assert_eq!(strings.nbytes(), None);
    }
}
