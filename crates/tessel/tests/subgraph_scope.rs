//! Sub-graph scope rules: a name can be captured only from a strict
//! ancestor scope.

use tessel::graph::MAIN_GRAPH;
use tessel::shape::TensorInfo;
use tessel::{DType, DataFlow, ErrorKind, Ir, SessionOptions};

fn ir_with_scopes() -> Ir {
    let mut ir = Ir::new(DataFlow::default(), SessionOptions::default());
    ir.main_graph_mut()
        .tensors
        .add_stream("outer", TensorInfo::new(DType::Float32, vec![2]))
        .unwrap();
    ir.create_subgraph("then_branch", MAIN_GRAPH).unwrap();
    ir.create_subgraph("else_branch", MAIN_GRAPH).unwrap();
    ir.create_subgraph("nested", "then_branch").unwrap();
    ir
}

#[test]
fn capture_from_parent_scope_succeeds() {
    let mut ir = ir_with_scopes();
    let local = ir
        .add_input_from_higher_scope("then_branch", "outer")
        .unwrap();
    let graph = ir.graph("then_branch").unwrap();
    assert!(graph.tensors.contains(&local));
    assert_eq!(graph.higher_scope_inputs, vec![local]);
}

#[test]
fn capture_from_grand_ancestor_succeeds() {
    let mut ir = ir_with_scopes();
    assert!(ir.add_input_from_higher_scope("nested", "outer").is_ok());
}

#[test]
fn capture_of_sibling_declaration_is_rejected() {
    let mut ir = ir_with_scopes();
    ir.graph_mut("else_branch")
        .unwrap()
        .tensors
        .add_stream("sibling_only", TensorInfo::new(DType::Float32, vec![2]))
        .unwrap();
    let err = ir
        .add_input_from_higher_scope("then_branch", "sibling_only")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DanglingConsumer);
}

#[test]
fn capture_of_descendant_declaration_is_rejected() {
    let mut ir = ir_with_scopes();
    ir.graph_mut("nested")
        .unwrap()
        .tensors
        .add_stream("inner_only", TensorInfo::new(DType::Float32, vec![2]))
        .unwrap();
    let err = ir
        .add_input_from_higher_scope("then_branch", "inner_only")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DanglingConsumer);
}

#[test]
fn capture_of_own_declaration_is_rejected() {
    let mut ir = ir_with_scopes();
    ir.graph_mut("then_branch")
        .unwrap()
        .tensors
        .add_stream("own", TensorInfo::new(DType::Float32, vec![2]))
        .unwrap();
    let err = ir
        .add_input_from_higher_scope("then_branch", "own")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DanglingConsumer);
}
