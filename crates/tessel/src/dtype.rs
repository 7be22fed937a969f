//! Enumerates the scalar element types the IR can carry.

use crate::error::{error, ErrorKind, Result};

/// Logical element type of a tensor. The set is closed: every tensor in the
/// IR carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
    String,
    Complex64,
    Complex128,
}

impl DType {
    /// Bytes per scalar element, or `None` for variable-width types.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::Int8 | DType::Uint8 | DType::Bool => Some(1),
            DType::Float16 | DType::Int16 | DType::Uint16 => Some(2),
            DType::Float32 | DType::Int32 | DType::Uint32 => Some(4),
            DType::Int64 | DType::Uint64 | DType::Complex64 => Some(8),
            DType::Complex128 => Some(16),
            DType::String => None,
        }
    }

    /// The ONNX spelling of this type, as found in `TensorProto.DataType`.
    pub fn onnx_name(self) -> &'static str {
        match self {
            DType::Float32 => "FLOAT",
            DType::Float16 => "FLOAT16",
            DType::Int8 => "INT8",
            DType::Int16 => "INT16",
            DType::Int32 => "INT32",
            DType::Int64 => "INT64",
            DType::Uint8 => "UINT8",
            DType::Uint16 => "UINT16",
            DType::Uint32 => "UINT32",
            DType::Uint64 => "UINT64",
            DType::Bool => "BOOL",
            DType::String => "STRING",
            DType::Complex64 => "COMPLEX64",
            DType::Complex128 => "COMPLEX128",
        }
    }

    /// Inverse of [`DType::onnx_name`].
    pub fn from_onnx_name(name: &str) -> Result<Self> {
        ALL.iter()
            .copied()
            .find(|d| d.onnx_name() == name)
            .ok_or_else(|| error!(ErrorKind::TypeMismatch, "no element type named {name}"))
    }

    /// Maps the integer tag used by `TensorProto.data_type`.
    pub fn from_onnx_tag(tag: i32) -> Result<Self> {
        let dtype = match tag {
            1 => DType::Float32,
            2 => DType::Uint8,
            3 => DType::Int8,
            4 => DType::Uint16,
            5 => DType::Int16,
            6 => DType::Int32,
            7 => DType::Int64,
            8 => DType::String,
            9 => DType::Bool,
            10 => DType::Float16,
            12 => DType::Uint32,
            13 => DType::Uint64,
            14 => DType::Complex64,
            15 => DType::Complex128,
            other => {
                return Err(error!(
                    ErrorKind::TypeMismatch,
                    "unsupported ONNX element type tag {other}"
                ))
            }
        };
        Ok(dtype)
    }

    /// The tag written back when exporting to `TensorProto.data_type`.
    pub fn onnx_tag(self) -> i32 {
        match self {
            DType::Float32 => 1,
            DType::Uint8 => 2,
            DType::Int8 => 3,
            DType::Uint16 => 4,
            DType::Int16 => 5,
            DType::Int32 => 6,
            DType::Int64 => 7,
            DType::String => 8,
            DType::Bool => 9,
            DType::Float16 => 10,
            DType::Uint32 => 12,
            DType::Uint64 => 13,
            DType::Complex64 => 14,
            DType::Complex128 => 15,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::Float32 | DType::Float16)
    }
}

const ALL: &[DType] = &[
    DType::Float32,
    DType::Float16,
    DType::Int8,
    DType::Int16,
    DType::Int32,
    DType::Int64,
    DType::Uint8,
    DType::Uint16,
    DType::Uint32,
    DType::Uint64,
    DType::Bool,
    DType::String,
    DType::Complex64,
    DType::Complex128,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onnx_names_round_trip() {
        for &dtype in ALL {
            assert_eq!(DType::from_onnx_name(dtype.onnx_name()).unwrap(), dtype);
        }
    }

    #[test]
    fn onnx_tags_round_trip() {
        for &dtype in ALL {
            assert_eq!(DType::from_onnx_tag(dtype.onnx_tag()).unwrap(), dtype);
        }
    }

    #[test]
    fn element_sizes() {
        assert_eq!(DType::Float32.size_in_bytes(), Some(4));
        assert_eq!(DType::Float16.size_in_bytes(), Some(2));
        assert_eq!(DType::Int64.size_in_bytes(), Some(8));
        assert_eq!(DType::Bool.size_in_bytes(), Some(1));
        assert_eq!(DType::Complex128.size_in_bytes(), Some(16));
        assert_eq!(DType::String.size_in_bytes(), None);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = DType::from_onnx_tag(11).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TypeMismatch);
    }
}
