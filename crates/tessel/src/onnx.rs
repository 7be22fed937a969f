//! ONNX protobuf messages and decode helpers.
//!
//! The message definitions mirror the subset of `onnx.proto3` the compiler
//! consumes, in the exact form `prost-build` emits, so a serialized
//! `ModelProto` from any ONNX exporter decodes directly.

use prost::Message;

use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::shape::TensorInfo;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub producer_version: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub domain: ::prost::alloc::string::String,
    #[prost(int64, tag = "5")]
    pub model_version: i64,
    #[prost(message, optional, tag = "7")]
    pub graph: ::core::option::Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: ::prost::alloc::vec::Vec<OperatorSetIdProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: ::prost::alloc::vec::Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: ::prost::alloc::vec::Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: ::prost::alloc::vec::Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: ::prost::alloc::vec::Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "13")]
    pub value_info: ::prost::alloc::vec::Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "2")]
    pub output: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "3")]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub op_type: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: ::prost::alloc::vec::Vec<AttributeProto>,
    #[prost(string, tag = "7")]
    pub domain: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub t: ::core::option::Option<TensorProto>,
    #[prost(message, optional, boxed, tag = "6")]
    pub g: ::core::option::Option<::prost::alloc::boxed::Box<GraphProto>>,
    #[prost(float, repeated, tag = "7")]
    pub floats: ::prost::alloc::vec::Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: ::prost::alloc::vec::Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub strings: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(enumeration = "AttributeType", tag = "20")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AttributeType {
    Undefined = 0,
    Float = 1,
    Int = 2,
    String = 3,
    Tensor = 4,
    Graph = 5,
    Floats = 6,
    Ints = 7,
    Strings = 8,
    Tensors = 9,
    Graphs = 10,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: ::prost::alloc::vec::Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: ::prost::alloc::vec::Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: ::prost::alloc::vec::Vec<i32>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: ::prost::alloc::vec::Vec<i64>,
    #[prost(string, tag = "8")]
    pub name: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, repeated, tag = "11")]
    pub uint64_data: ::prost::alloc::vec::Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub r#type: ::core::option::Option<TypeProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: ::core::option::Option<TypeProtoTensor>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypeProtoTensor {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
    #[prost(message, optional, tag = "2")]
    pub shape: ::core::option::Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: ::prost::alloc::vec::Vec<TensorShapeDim>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorShapeDim {
    #[prost(int64, tag = "1")]
    pub dim_value: i64,
    #[prost(string, tag = "2")]
    pub dim_param: ::prost::alloc::string::String,
}

/// Oldest model IR version the loader accepts.
pub const MIN_IR_VERSION: i64 = 3;

/// Decodes a serialized `ModelProto` and checks the IR-version floor.
pub fn decode_model(bytes: &[u8]) -> Result<ModelProto> {
    let model = ModelProto::decode(bytes).map_err(|e| {
        error!(ErrorKind::UnknownOperator, "failed to decode ONNX model: {e}")
    })?;
    if model.ir_version != 0 && model.ir_version < MIN_IR_VERSION {
        return Err(error!(
            ErrorKind::UnknownOperator,
            "ONNX IR version {} is older than the supported minimum {}",
            model.ir_version,
            MIN_IR_VERSION
        ));
    }
    Ok(model)
}

/// Element type and shape declared by a `ValueInfoProto`.
pub fn value_info(proto: &ValueInfoProto) -> Result<TensorInfo> {
    let tensor_type = proto
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .ok_or_else(|| {
            error!(
                ErrorKind::TypeMismatch,
                "value info {} has no tensor type", proto.name
            )
        })?;
    let dtype = DType::from_onnx_tag(tensor_type.elem_type)?;
    let shape = tensor_type
        .shape
        .as_ref()
        .map(|s| s.dim.iter().map(|d| d.dim_value).collect::<Vec<_>>())
        .unwrap_or_default();
    if shape.iter().any(|&d| d < 0) {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "value info {} has a negative extent", proto.name
        ));
    }
    Ok(TensorInfo::new(dtype, shape))
}

/// Element type and shape of an initializer.
pub fn tensor_info(proto: &TensorProto) -> Result<TensorInfo> {
    let dtype = DType::from_onnx_tag(proto.data_type)?;
    Ok(TensorInfo::new(dtype, proto.dims.clone()))
}

/// Dense little-endian bytes of an initializer, from `raw_data` when present
/// or from the typed repeated fields otherwise.
pub fn tensor_bytes(proto: &TensorProto) -> Result<Vec<u8>> {
    let info = tensor_info(proto)?;
    let expected = info.nbytes().ok_or_else(|| {
        error!(
            ErrorKind::TypeMismatch,
            "initializer {} has a variable-width element type", proto.name
        )
    })?;

    let bytes = if !proto.raw_data.is_empty() {
        proto.raw_data.clone()
    } else {
        let mut out = Vec::with_capacity(expected as usize);
        match info.dtype() {
            DType::Float32 => {
                for v in &proto.float_data {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            DType::Int64 => {
                for v in &proto.int64_data {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            DType::Uint64 => {
                for v in &proto.uint64_data {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            // int32_data backs every narrow integer type in the ONNX
            // encoding, including bool and float16 bit patterns.
            DType::Int32 => {
                for v in &proto.int32_data {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            DType::Int8 | DType::Uint8 | DType::Bool => {
                for v in &proto.int32_data {
                    out.push(*v as u8);
                }
            }
            DType::Int16 | DType::Uint16 | DType::Float16 => {
                for v in &proto.int32_data {
                    out.extend_from_slice(&(*v as u16).to_le_bytes());
                }
            }
            DType::Uint32 => {
                for v in &proto.int32_data {
                    out.extend_from_slice(&(*v as u32).to_le_bytes());
                }
            }
            other => {
                return Err(error!(
                    ErrorKind::TypeMismatch,
                    "initializer {} has unsupported element type {}",
                    proto.name,
                    other.onnx_name()
                ))
            }
        }
        out
    };

    if bytes.len() as i64 != expected {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "initializer {} carries {} bytes, expected {}",
            proto.name,
            bytes.len(),
            expected
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_round_trips_through_prost() {
        let model = ModelProto {
            ir_version: 7,
            graph: Some(GraphProto {
                name: "g".into(),
                node: vec![NodeProto {
                    input: vec!["x".into()],
                    output: vec!["y".into()],
                    op_type: "Relu".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let bytes = model.encode_to_vec();
        let decoded = decode_model(&bytes).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn old_ir_versions_are_rejected() {
        let model = ModelProto {
            ir_version: 1,
            ..Default::default()
        };
        assert!(decode_model(&model.encode_to_vec()).is_err());
    }

    #[test]
    fn initializer_bytes_from_typed_fields() {
        let proto = TensorProto {
            dims: vec![2, 2],
            data_type: DType::Int32.onnx_tag(),
            int32_data: vec![1, 2, 3, 4],
            name: "w".into(),
            ..Default::default()
        };
        let bytes = tensor_bytes(&proto).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &1i32.to_le_bytes());
    }

    #[test]
    fn initializer_bytes_must_match_info() {
        let proto = TensorProto {
            dims: vec![3],
            data_type: DType::Float32.onnx_tag(),
            raw_data: vec![0u8; 8],
            name: "w".into(),
            ..Default::default()
        };
        let err = tensor_bytes(&proto).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }
}
