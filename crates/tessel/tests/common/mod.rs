//! Shared graph-building helpers for the integration tests.
#![allow(dead_code)]

use tessel::attributes::Attributes;
use tessel::graph::Graph;
use tessel::op::{OpId, OpSettings, OperatorId};
use tessel::shape::TensorInfo;
use tessel::DType;

/// Adds a fully wired op: inputs must exist, outputs are created, shape
/// inference runs.
pub fn wire_op(
    graph: &mut Graph,
    operator: OperatorId,
    attrs: Attributes,
    name: &str,
    vgid: Option<i64>,
    inputs: &[&str],
    outputs: &[&str],
) -> OpId {
    let mut settings = OpSettings::named(name);
    settings.virtual_graph_id = vgid;
    let op = graph.add_op(operator, attrs, settings);
    for (index, tensor) in inputs.iter().enumerate() {
        graph.connect_in(op, index, tensor).unwrap();
    }
    for (index, tensor) in outputs.iter().enumerate() {
        graph.create_and_connect_out(op, index, tensor).unwrap();
    }
    graph.setup_op(op).unwrap();
    op
}

pub fn add_stream(graph: &mut Graph, id: &str, shape: &[i64]) {
    graph
        .tensors
        .add_stream(id, TensorInfo::new(DType::Float32, shape.to_vec()))
        .unwrap();
}

pub fn add_variable(graph: &mut Graph, id: &str, shape: &[i64]) {
    let info = TensorInfo::new(DType::Float32, shape.to_vec());
    let nbytes = info.nbytes().unwrap() as usize;
    graph
        .tensors
        .add_variable(id, info, vec![0u8; nbytes])
        .unwrap();
}

/// Number of ops in the graph with the given operator id.
pub fn count_ops(graph: &Graph, operator: &OperatorId) -> usize {
    graph.ops().filter(|op| &op.operator == operator).count()
}

/// The single op with the given operator id, if there is exactly one.
pub fn find_op(graph: &Graph, operator: &OperatorId) -> Option<OpId> {
    let mut found = graph.ops().filter(|op| &op.operator == operator);
    let first = found.next().map(|op| op.id);
    if found.next().is_some() {
        return None;
    }
    first
}

pub fn i32_le_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
