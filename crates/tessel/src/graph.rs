//! The graph arena: ops, tensors, wiring primitives and topological
//! constraints.
//!
//! Entities refer to each other exclusively through handles (`OpId`,
//! `TensorId`); the wiring primitives here are the only place handles are
//! resolved, and they keep the producer/consumer relation bidirectionally
//! consistent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::attributes::Attributes;
use crate::error::{error, ErrorKind, Result};
use crate::op::{Op, OpId, OpSettings, OperatorId};
use crate::ops;
use crate::shape::TensorInfo;
use crate::tensor::{Tensor, TensorClass, TensorData, TensorId};

pub type GraphId = String;

/// Name of the root graph of every IR.
pub const MAIN_GRAPH: &str = "main";

/// Monotonic op-id source owned by the IR and shared with its graphs.
#[derive(Debug, Clone, Default)]
pub struct OpIdCounter(Arc<AtomicU64>);

impl OpIdCounter {
    pub fn next(&self) -> OpId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn current(&self) -> OpId {
        self.0.load(Ordering::Relaxed)
    }
}

/// Explicit "A must precede B" constraints, distinct from dataflow edges.
#[derive(Debug, Clone, Default)]
pub struct TopoCons {
    afters: BTreeMap<OpId, BTreeSet<OpId>>,
    befores: BTreeMap<OpId, BTreeSet<OpId>>,
}

impl TopoCons {
    /// Requires `before` to be scheduled ahead of `after`.
    pub fn insert(&mut self, before: OpId, after: OpId) -> Result<()> {
        if before == after {
            return Err(error!(
                ErrorKind::ConstraintConflict,
                "op {before} cannot be constrained against itself"
            ));
        }
        if self.afters.get(&after).is_some_and(|s| s.contains(&before)) {
            return Err(error!(
                ErrorKind::ConstraintConflict,
                "contradictory constraint: {after} already precedes {before}"
            ));
        }
        self.afters.entry(before).or_default().insert(after);
        self.befores.entry(after).or_default().insert(before);
        Ok(())
    }

    /// Ops constrained to run after `op`.
    pub fn afters(&self, op: OpId) -> Vec<OpId> {
        self.afters
            .get(&op)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ops constrained to run before `op`.
    pub fn befores(&self, op: OpId) -> Vec<OpId> {
        self.befores
            .get(&op)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove_op(&mut self, op: OpId) {
        if let Some(afters) = self.afters.remove(&op) {
            for after in afters {
                if let Some(set) = self.befores.get_mut(&after) {
                    set.remove(&op);
                }
            }
        }
        if let Some(befores) = self.befores.remove(&op) {
            for before in befores {
                if let Some(set) = self.afters.get_mut(&before) {
                    set.remove(&op);
                }
            }
        }
    }

    /// Moves every constraint of `from` onto `to`; used when a pattern
    /// replaces an op with a rewritten equivalent.
    pub fn transfer(&mut self, from: OpId, to: OpId) -> Result<()> {
        let afters = self.afters(from);
        let befores = self.befores(from);
        self.remove_op(from);
        for after in afters {
            if after != to {
                self.insert(to, after)?;
            }
        }
        for before in befores {
            if before != to {
                self.insert(before, to)?;
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (OpId, OpId)> + '_ {
        self.afters
            .iter()
            .flat_map(|(before, afters)| afters.iter().map(move |after| (*before, *after)))
    }
}

/// Tensor sub-store of one graph.
#[derive(Debug, Clone, Default)]
pub struct Tensors {
    map: BTreeMap<TensorId, Tensor>,
}

impl Tensors {
    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<&Tensor> {
        self.map
            .get(id)
            .ok_or_else(|| error!(ErrorKind::DanglingConsumer, "no tensor {id} in graph"))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Tensor> {
        self.map
            .get_mut(id)
            .ok_or_else(|| error!(ErrorKind::DanglingConsumer, "no tensor {id} in graph"))
    }

    /// Adds a tensor of the given class. Const tensors must go through
    /// [`Tensors::add_const_init`] so the buffer invariant is checked.
    pub fn add(&mut self, class: TensorClass, id: impl Into<TensorId>, info: TensorInfo) -> Result<()> {
        if class == TensorClass::Const {
            return Err(Error::internal(
                "Const tensors must be added with their initial bytes",
            ));
        }
        self.insert(Tensor::new(id.into(), class, Some(info)))
    }

    pub fn add_stream(&mut self, id: impl Into<TensorId>, info: TensorInfo) -> Result<()> {
        self.add(TensorClass::Stream, id, info)
    }

    pub fn add_variable(
        &mut self,
        id: impl Into<TensorId>,
        info: TensorInfo,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let id = id.into();
        check_buffer(&id, &info, &bytes)?;
        let mut tensor = Tensor::new(id, TensorClass::Variable, Some(info));
        tensor.data = Some(TensorData::new(bytes));
        self.insert(tensor)
    }

    /// Adds a compile-time literal; the buffer must be exactly
    /// `nbytes(shape, dtype)` long.
    pub fn add_const_init(
        &mut self,
        id: impl Into<TensorId>,
        info: TensorInfo,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let id = id.into();
        check_buffer(&id, &info, &bytes)?;
        let mut tensor = Tensor::new(id, TensorClass::Const, Some(info));
        tensor.data = Some(TensorData::new(bytes));
        self.insert(tensor)
    }

    /// Adds a transient tensor whose info is filled in by its producer's
    /// shape inference.
    pub fn add_act_grad(&mut self, id: impl Into<TensorId>) -> Result<()> {
        self.insert(Tensor::new(id.into(), TensorClass::ActGrad, None))
    }

    pub fn add_with_data(
        &mut self,
        class: TensorClass,
        id: impl Into<TensorId>,
        info: TensorInfo,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let id = id.into();
        check_buffer(&id, &info, &bytes)?;
        let mut tensor = Tensor::new(id, class, Some(info));
        tensor.data = Some(TensorData::new(bytes));
        self.insert(tensor)
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        self.map
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| error!(ErrorKind::DanglingConsumer, "cannot remove absent tensor {id}"))
    }

    pub fn ids(&self) -> Vec<TensorId> {
        self.map.keys().cloned().collect()
    }

    pub fn ids_of_class(&self, class: TensorClass) -> Vec<TensorId> {
        self.map
            .values()
            .filter(|t| t.class == class)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.map.values()
    }

    fn insert(&mut self, tensor: Tensor) -> Result<()> {
        let id = tensor.id.clone();
        if self.map.insert(id.clone(), tensor).is_some() {
            return Err(error!(
                ErrorKind::DuplicateProducer,
                "tensor {id} already exists in graph"
            ));
        }
        Ok(())
    }
}

fn check_buffer(id: &str, info: &TensorInfo, bytes: &[u8]) -> Result<()> {
    let expected = info.nbytes().ok_or_else(|| {
        error!(
            ErrorKind::TypeMismatch,
            "tensor {id} of element type {} cannot carry a host buffer",
            info.dtype().onnx_name()
        )
    })?;
    if bytes.len() as i64 != expected {
        return Err(error!(
            ErrorKind::ShapeMismatch,
            "tensor {id} buffer is {} bytes, info {info} requires {expected}",
            bytes.len()
        ));
    }
    Ok(())
}

use crate::error::Error;

/// One dataflow graph. The IR owns a root graph plus any sub-graphs
/// referenced by control-flow ops; sub-graphs record their parent scope.
#[derive(Debug, Clone)]
pub struct Graph {
    pub id: GraphId,
    pub parent: Option<GraphId>,
    ops: BTreeMap<OpId, Op>,
    pub tensors: Tensors,
    pub topo_cons: TopoCons,
    /// Tensors captured from an enclosing scope, in capture order.
    pub higher_scope_inputs: Vec<TensorId>,
    counter: OpIdCounter,
}

impl Graph {
    pub fn new(id: impl Into<GraphId>, parent: Option<GraphId>, counter: OpIdCounter) -> Self {
        Graph {
            id: id.into(),
            parent,
            ops: BTreeMap::new(),
            tensors: Tensors::default(),
            topo_cons: TopoCons::default(),
            higher_scope_inputs: Vec::new(),
            counter,
        }
    }

    pub fn op(&self, id: OpId) -> Result<&Op> {
        self.ops
            .get(&id)
            .ok_or_else(|| error!(ErrorKind::InternalLogicError, "no op {id} in graph {}", self.id))
    }

    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Op> {
        self.ops
            .get_mut(&id)
            .ok_or_else(|| error!(ErrorKind::InternalLogicError, "no op {id} in graph {}", self.id))
    }

    pub fn has_op(&self, id: OpId) -> bool {
        self.ops.contains_key(&id)
    }

    /// All op ids in ascending id order.
    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.ops.values()
    }

    pub fn n_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn tensor(&self, id: &str) -> Result<&Tensor> {
        self.tensors.get(id)
    }

    pub fn tensor_mut(&mut self, id: &str) -> Result<&mut Tensor> {
        self.tensors.get_mut(id)
    }

    pub fn tensor_info(&self, id: &str) -> Result<&TensorInfo> {
        self.tensors.get(id)?.info()
    }

    /// Creates a fresh, unwired op and returns its id.
    pub fn add_op(
        &mut self,
        operator: OperatorId,
        attrs: Attributes,
        settings: OpSettings,
    ) -> OpId {
        let id = self.counter.next();
        self.ops.insert(id, Op::new(id, operator, settings, attrs));
        id
    }

    /// Takes ownership of an op value built elsewhere (e.g. a clone),
    /// stamping a fresh id.
    pub fn move_into_graph(&mut self, mut op: Op) -> OpId {
        let id = self.counter.next();
        op.id = id;
        op.inputs.clear();
        op.outputs.clear();
        self.ops.insert(id, op);
        id
    }

    /// Deep structural clone of an op with no connections and no identity.
    pub fn clone_op(&self, id: OpId) -> Result<Op> {
        let mut clone = self.op(id)?.clone();
        clone.inputs.clear();
        clone.outputs.clear();
        Ok(clone)
    }

    /// Wires `tensor` as input `index` of `op` and bumps its consumer count.
    pub fn connect_in(&mut self, op: OpId, index: usize, tensor: &str) -> Result<()> {
        if !self.tensors.contains(tensor) {
            return Err(error!(
                ErrorKind::DanglingConsumer,
                "op {op} cannot consume absent tensor {tensor}"
            ));
        }
        let op_ref = self.op_mut(op)?;
        if op_ref.inputs.contains_key(&index) {
            return Err(Error::internal(format!(
                "op {} input {index} is already connected",
                op_ref.debug_name()
            )));
        }
        op_ref.inputs.insert(index, tensor.to_string());
        self.tensors.get_mut(tensor)?.consumers.increment(op);
        Ok(())
    }

    pub fn disconnect_in(&mut self, op: OpId, index: usize) -> Result<()> {
        let tensor = {
            let op_ref = self.op_mut(op)?;
            op_ref.inputs.remove(&index).ok_or_else(|| {
                Error::internal(format!("op {op} has no input {index} to disconnect"))
            })?
        };
        self.tensors.get_mut(&tensor)?.consumers.decrement(op)
    }

    pub fn disconnect_all_inputs(&mut self, op: OpId) -> Result<()> {
        let indices: Vec<usize> = self.op(op)?.inputs.keys().copied().collect();
        for index in indices {
            self.disconnect_in(op, index)?;
        }
        Ok(())
    }

    /// Makes `op` the producer of an existing tensor.
    pub fn connect_out(&mut self, op: OpId, index: usize, tensor: &str) -> Result<()> {
        {
            let t = self.tensors.get(tensor)?;
            if t.class == TensorClass::Stream {
                return Err(error!(
                    ErrorKind::DuplicateProducer,
                    "stream tensor {tensor} cannot have a producer"
                ));
            }
            if let Some(existing) = t.producer {
                return Err(error!(
                    ErrorKind::DuplicateProducer,
                    "tensor {tensor} is already produced by op {existing}"
                ));
            }
        }
        let op_ref = self.op_mut(op)?;
        if op_ref.outputs.contains_key(&index) {
            return Err(Error::internal(format!(
                "op {} output {index} is already connected",
                op_ref.debug_name()
            )));
        }
        op_ref.outputs.insert(index, tensor.to_string());
        self.tensors.get_mut(tensor)?.producer = Some(op);
        Ok(())
    }

    pub fn disconnect_out(&mut self, op: OpId, index: usize) -> Result<()> {
        let tensor = {
            let op_ref = self.op_mut(op)?;
            op_ref.outputs.remove(&index).ok_or_else(|| {
                Error::internal(format!("op {op} has no output {index} to disconnect"))
            })?
        };
        self.tensors.get_mut(&tensor)?.producer = None;
        Ok(())
    }

    pub fn disconnect_all_outputs(&mut self, op: OpId) -> Result<()> {
        let indices: Vec<usize> = self.op(op)?.outputs.keys().copied().collect();
        for index in indices {
            self.disconnect_out(op, index)?;
        }
        Ok(())
    }

    /// Creates a fresh ActGrad tensor and wires it as output `index`.
    pub fn create_and_connect_out(&mut self, op: OpId, index: usize, tensor: &str) -> Result<()> {
        self.tensors.add_act_grad(tensor)?;
        self.connect_out(op, index, tensor)
    }

    /// Rewires every occurrence of `old` among `op`'s inputs to `new`.
    pub fn replace_input(&mut self, op: OpId, old: &str, new: &str) -> Result<()> {
        let indices = self.op(op)?.input_indices(old);
        if indices.is_empty() {
            return Err(Error::internal(format!(
                "op {op} does not consume {old}"
            )));
        }
        for index in indices {
            self.disconnect_in(op, index)?;
            self.connect_in(op, index, new)?;
        }
        Ok(())
    }

    /// Unwires and deletes an op, dropping its topological constraints.
    pub fn erase_op(&mut self, id: OpId) -> Result<()> {
        self.disconnect_all_inputs(id)?;
        self.disconnect_all_outputs(id)?;
        self.topo_cons.remove_op(id);
        self.ops.remove(&id);
        Ok(())
    }

    /// Deletes a tensor that is no longer produced or consumed.
    pub fn remove_isolated_tensor(&mut self, id: &str) -> Result<()> {
        let tensor = self.tensors.get(id)?;
        if tensor.has_producer() {
            return Err(error!(
                ErrorKind::DanglingConsumer,
                "tensor {id} still has a producer"
            ));
        }
        if !tensor.consumers.is_empty() {
            return Err(error!(
                ErrorKind::DanglingConsumer,
                "tensor {id} still has consumers"
            ));
        }
        self.tensors.remove(id)
    }

    /// Runs schema checks and shape inference for an op, writing the
    /// inferred infos onto its output tensors. The element type and rank of
    /// a tensor whose info was already set may not change.
    pub fn setup_op(&mut self, id: OpId) -> Result<()> {
        let op = self.op(id)?.clone();
        let mut input_infos: BTreeMap<usize, TensorInfo> = BTreeMap::new();
        for (index, tensor) in op.inputs() {
            input_infos.insert(index, self.tensor_info(tensor)?.clone());
        }
        ops::check_schema(&op, &input_infos)?;
        let def = ops::opdef(&op.operator)?;
        let ctx = ops::SetupCtx::new(&op, &input_infos);
        let inferred = (def.setup)(&ctx)?;
        if inferred.len() != op.n_outputs() {
            return Err(Error::internal(format!(
                "setup of {} produced {} infos for {} outputs",
                op.debug_name(),
                inferred.len(),
                op.n_outputs()
            )));
        }
        for ((_, tensor), info) in op.outputs().zip(inferred.into_iter()) {
            let slot = self.tensors.get_mut(tensor)?;
            match &slot.info {
                None => slot.info = Some(info),
                Some(existing) => {
                    if existing.dtype() != info.dtype() || existing.rank() != info.rank() {
                        return Err(error!(
                            ErrorKind::ShapeMismatch,
                            "setup of op {} would change tensor {tensor} from {existing} to {info}",
                            op.debug_name()
                        ));
                    }
                    slot.info = Some(info);
                }
            }
        }
        Ok(())
    }

    /// Checks the §3 store invariants; used by tests and after transforms.
    pub fn verify(&self) -> Result<()> {
        for op in self.ops.values() {
            for (_, tensor) in op.inputs() {
                let t = self.tensors.get(tensor)?;
                let expected = op.input_indices(tensor).len();
                if t.consumers.count(op.id) != expected {
                    return Err(Error::internal(format!(
                        "tensor {tensor} counts op {} {} times, expected {expected}",
                        op.id,
                        t.consumers.count(op.id)
                    )));
                }
            }
            for (index, tensor) in op.outputs() {
                let t = self.tensors.get(tensor)?;
                if t.producer != Some(op.id) {
                    return Err(error!(
                        ErrorKind::MissingProducer,
                        "tensor {tensor} does not point back at producer op {} output {index}",
                        op.id
                    ));
                }
            }
        }
        for tensor in self.tensors.iter() {
            if let Some(producer) = tensor.producer {
                let op = self.op(producer)?;
                if op.output_index(&tensor.id).is_none() {
                    return Err(error!(
                        ErrorKind::MissingProducer,
                        "tensor {} names producer {} which does not output it",
                        tensor.id,
                        producer
                    ));
                }
            }
            for consumer in tensor.consumers.ops() {
                let op = self.op(consumer)?;
                if op.input_indices(&tensor.id).is_empty() {
                    return Err(error!(
                        ErrorKind::DanglingConsumer,
                        "tensor {} counts consumer {} which does not input it",
                        tensor.id,
                        consumer
                    ));
                }
            }
            if tensor.class == TensorClass::Const {
                let info = tensor.info()?;
                let expected = info.nbytes().ok_or_else(|| {
                    Error::internal(format!("const tensor {} has unsized type", tensor.id))
                })?;
                let actual = tensor.data().map(|d| d.len() as i64).unwrap_or(-1);
                if actual != expected {
                    return Err(error!(
                        ErrorKind::ShapeMismatch,
                        "const tensor {} buffer is {actual} bytes, info requires {expected}",
                        tensor.id
                    ));
                }
            }
            if tensor.class == TensorClass::Stream && tensor.has_producer() {
                return Err(error!(
                    ErrorKind::DuplicateProducer,
                    "stream tensor {} has a producer",
                    tensor.id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attributes;
    use crate::dtype::DType;
    use crate::ops::catalog;

    fn graph() -> Graph {
        crate::ops::register_builtin_ops();
        Graph::new(MAIN_GRAPH, None, OpIdCounter::default())
    }

    #[test]
    fn wiring_keeps_counts_and_producers_in_sync() {
        let mut g = graph();
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![2, 3]))
            .unwrap();
        let relu = g.add_op(catalog::RELU, Attributes::new(), OpSettings::named("act"));
        g.connect_in(relu, 0, "x").unwrap();
        g.create_and_connect_out(relu, 0, "y").unwrap();
        g.setup_op(relu).unwrap();

        assert_eq!(g.tensor("x").unwrap().consumers.total(), 1);
        assert_eq!(g.tensor("y").unwrap().producer().unwrap(), relu);
        assert_eq!(
            g.tensor_info("y").unwrap(),
            &TensorInfo::new(DType::Float32, vec![2, 3])
        );
        g.verify().unwrap();

        g.erase_op(relu).unwrap();
        assert_eq!(g.tensor("x").unwrap().consumers.total(), 0);
        assert!(!g.tensor("y").unwrap().has_producer());
        g.remove_isolated_tensor("y").unwrap();
        assert!(!g.tensors.contains("y"));
    }

    #[test]
    fn double_production_is_rejected() {
        let mut g = graph();
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![2]))
            .unwrap();
        let a = g.add_op(catalog::RELU, Attributes::new(), OpSettings::default());
        let b = g.add_op(catalog::RELU, Attributes::new(), OpSettings::default());
        g.connect_in(a, 0, "x").unwrap();
        g.connect_in(b, 0, "x").unwrap();
        g.create_and_connect_out(a, 0, "y").unwrap();
        let err = g.connect_out(b, 0, "y").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateProducer);
    }

    #[test]
    fn topo_cons_reject_contradictions() {
        let mut cons = TopoCons::default();
        cons.insert(1, 2).unwrap();
        assert_eq!(cons.afters(1), vec![2]);
        assert_eq!(cons.befores(2), vec![1]);
        let err = cons.insert(2, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintConflict);
        cons.remove_op(1);
        assert!(cons.befores(2).is_empty());
    }

    #[test]
    fn const_buffers_must_match_info() {
        let mut g = graph();
        let err = g
            .tensors
            .add_const_init("c", TensorInfo::new(DType::Int32, vec![2]), vec![0u8; 4])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }
}
