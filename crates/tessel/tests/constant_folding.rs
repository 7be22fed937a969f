//! Constant-expression folding, end to end through the ONNX loader: a
//! Transpose of a Constant disappears at compile time.

mod common;

use tessel::onnx::{
    AttributeProto, AttributeType, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    TensorProto, TensorShapeDim, TensorShapeProto, TypeProto, TypeProtoTensor, ValueInfoProto,
};
use tessel::ops::catalog;
use tessel::{
    AnchorReturnType, DataFlow, ErrorKind, Ir, SessionOptions, TensorClass,
};

fn int32_input(name: &str, shape: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            tensor_type: Some(TypeProtoTensor {
                elem_type: 6,
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

/// A Constant of shape [5, 2] holding 1..10, transposed (default perm) and
/// added to a host input of the given shape.
fn transpose_add_model(input_shape: &[i64]) -> ModelProto {
    let const_proto = TensorProto {
        dims: vec![5, 2],
        data_type: 6,
        int32_data: (1..=10).collect(),
        name: "const_data".into(),
        ..Default::default()
    };
    ModelProto {
        ir_version: 7,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 9,
        }],
        graph: Some(GraphProto {
            name: "transpose_fold".into(),
            node: vec![
                NodeProto {
                    op_type: "Constant".into(),
                    output: vec!["const_in".into()],
                    attribute: vec![AttributeProto {
                        name: "value".into(),
                        t: Some(const_proto),
                        r#type: AttributeType::Tensor as i32,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                NodeProto {
                    op_type: "Transpose".into(),
                    input: vec!["const_in".into()],
                    output: vec!["transposed".into()],
                    ..Default::default()
                },
                NodeProto {
                    op_type: "Add".into(),
                    input: vec!["transposed".into(), "in".into()],
                    output: vec!["out".into()],
                    ..Default::default()
                },
            ],
            input: vec![int32_input("in", input_shape)],
            output: vec![int32_input("out", &[2, 5])],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn transpose_of_constant_folds_to_const_tensor() {
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let mut ir =
        Ir::from_model_proto(&transpose_add_model(&[2, 5]), dataflow, SessionOptions::default())
            .unwrap();
    ir.prepare().unwrap();

    let graph = ir.main_graph();
    assert_eq!(common::count_ops(graph, &catalog::TRANSPOSE), 0);
    assert_eq!(common::count_ops(graph, &catalog::ADD), 1);

    let folded = graph.tensor("transposed").unwrap();
    assert_eq!(folded.class, TensorClass::Const);
    assert_eq!(folded.info().unwrap().shape(), &[2, 5]);
    let expected = common::i32_le_bytes(&[1, 3, 5, 7, 9, 2, 4, 6, 8, 10]);
    assert_eq!(folded.data().unwrap().data(), expected.as_slice());

    // The folded value feeds the remaining Add, whose output is anchored.
    let add = common::find_op(graph, &catalog::ADD).unwrap();
    assert_eq!(graph.op(add).unwrap().input(0).unwrap(), "transposed");
    graph.verify().unwrap();
}

#[test]
fn misaligned_add_operand_is_a_shape_mismatch() {
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let err =
        Ir::from_model_proto(&transpose_add_model(&[2, 4]), dataflow, SessionOptions::default())
            .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
}

#[test]
fn folding_recurses_through_const_chains() {
    // Transpose -> Transpose over a Constant folds down to a single Const
    // equal to the original values.
    let mut model = transpose_add_model(&[5, 2]);
    {
        let graph = model.graph.as_mut().unwrap();
        graph.node.insert(
            2,
            NodeProto {
                op_type: "Transpose".into(),
                input: vec!["transposed".into()],
                output: vec!["twice".into()],
                ..Default::default()
            },
        );
        graph.node[3].input[0] = "twice".into();
    }
    let dataflow = DataFlow::new(1, [("out".to_string(), AnchorReturnType::All)]).unwrap();
    let mut ir = Ir::from_model_proto(&model, dataflow, SessionOptions::default()).unwrap();
    ir.prepare().unwrap();

    let graph = ir.main_graph();
    assert_eq!(common::count_ops(graph, &catalog::TRANSPOSE), 0);
    let folded = graph.tensor("twice").unwrap();
    assert_eq!(folded.class, TensorClass::Const);
    assert_eq!(folded.info().unwrap().shape(), &[5, 2]);
    let expected = common::i32_le_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(folded.data().unwrap().data(), expected.as_slice());
}
