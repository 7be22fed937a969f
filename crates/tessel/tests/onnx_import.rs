//! ONNX ingestion: initializers become Variables, graph inputs become
//! Streams, nodes resolve against the opset, unknown ops are rejected.

mod common;

use anyhow::Result;
use prost::Message;
use tessel::onnx::{
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeDim,
    TensorShapeProto, TypeProto, TypeProtoTensor, ValueInfoProto,
};
use tessel::ops::catalog;
use tessel::{AnchorReturnType, DataFlow, DType, ErrorKind, Ir, SessionOptions, TensorClass};

fn float_input(name: &str, shape: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            tensor_type: Some(TypeProtoTensor {
                elem_type: DType::Float32.onnx_tag(),
                shape: Some(TensorShapeProto {
                    dim: shape
                        .iter()
                        .map(|&d| TensorShapeDim {
                            dim_value: d,
                            ..Default::default()
                        })
                        .collect(),
                }),
            }),
        }),
    }
}

fn linear_model() -> ModelProto {
    ModelProto {
        ir_version: 7,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 11,
        }],
        graph: Some(GraphProto {
            name: "linear".into(),
            initializer: vec![TensorProto {
                dims: vec![4, 4],
                data_type: DType::Float32.onnx_tag(),
                float_data: vec![0.5; 16],
                name: "weight".into(),
                ..Default::default()
            }],
            input: vec![float_input("x", &[8, 4]), float_input("weight", &[4, 4])],
            node: vec![
                NodeProto {
                    op_type: "MatMul".into(),
                    input: vec!["x".into(), "weight".into()],
                    output: vec!["projected".into()],
                    name: "proj".into(),
                    ..Default::default()
                },
                NodeProto {
                    op_type: "Relu".into(),
                    input: vec!["projected".into()],
                    output: vec!["out".into()],
                    ..Default::default()
                },
            ],
            output: vec![float_input("out", &[8, 4])],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn initializers_become_variables_and_inputs_become_streams() -> Result<()> {
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::Final)])?;
    let bytes = linear_model().encode_to_vec();
    let ir = Ir::from_onnx_bytes(&bytes, dataflow, SessionOptions::default())?;

    let graph = ir.main_graph();
    let weight = graph.tensor("weight")?;
    assert_eq!(weight.class, TensorClass::Variable);
    assert_eq!(weight.data().unwrap().len(), 64);
    assert_eq!(graph.tensor("x")?.class, TensorClass::Stream);

    assert_eq!(common::count_ops(graph, &catalog::MATMUL), 1);
    assert_eq!(graph.tensor_info("projected")?.shape(), &[8, 4]);
    graph.verify()?;
    Ok(())
}

#[test]
fn unknown_operators_are_rejected() {
    let mut model = linear_model();
    model.graph.as_mut().unwrap().node[1].op_type = "FancyActivation".into();
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let err = Ir::from_model_proto(&model, dataflow, SessionOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownOperator);
}

#[test]
fn ops_above_the_declared_opset_are_rejected() {
    let mut model = linear_model();
    // MatMul registers at opset 9; a model pinned to opset 7 cannot reach
    // it.
    model.opset_import[0].version = 7;
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let err = Ir::from_model_proto(&model, dataflow, SessionOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownOperator);
}
