//! The intermediate representation: root graph, sub-graph scopes, data-flow
//! policy, losses, optimizer and the compilation driver.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attributes::{AttrValue, Attributes};
use crate::dataflow::DataFlow;
use crate::error::{error, ErrorKind, Result};
use crate::graph::{Graph, GraphId, OpIdCounter, MAIN_GRAPH};
use crate::loss::{Loss, LossKind};
use crate::onnx;
use crate::op::{OpId, OpSettings};
use crate::ops::{self, catalog};
use crate::optimizer::Sgd;
use crate::scheduler;
use crate::shape::TensorInfo;
use crate::tensor::{TensorClass, TensorId};

/// Automatic recomputation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecomputationStrategy {
    #[default]
    None,
    /// Decreasing intervals over the forward schedule, checkpointing the
    /// minimum-memory live set of each interval.
    Standard,
    /// Recompute normalization ops and the elementwise ops following them.
    NormOnly,
    /// Full recomputation per pipeline stage; only stash tensors entering
    /// a stage from outside.
    Pipeline,
}

/// Var-update merging policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeVarUpdatePolicy {
    #[default]
    None,
    /// One fused update per group of identical hyperparameters.
    All,
    /// Merge greedily until the concatenated weights exceed the threshold.
    AutoTight { threshold_bytes: i64 },
}

/// User-facing compilation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub enable_pipelining: bool,
    pub auto_recomputation: RecomputationStrategy,
    pub enable_gradient_accumulation: bool,
    pub accumulation_factor: i64,
    pub replicated_graph_count: i64,
    pub merge_var_update: MergeVarUpdatePolicy,
    pub batch_serialization_factor: i64,
    /// Use DynamicSlice/DynamicUpdate instead of static Slice/Concat when
    /// serializing batches.
    pub batch_serialization_dynamic: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            enable_pipelining: false,
            auto_recomputation: RecomputationStrategy::None,
            enable_gradient_accumulation: false,
            accumulation_factor: 1,
            replicated_graph_count: 1,
            merge_var_update: MergeVarUpdatePolicy::None,
            batch_serialization_factor: 1,
            batch_serialization_dynamic: false,
        }
    }
}

/// The IR of one compilation. Owns the root graph and any sub-graphs, and
/// drives construction, autodiff, transforms and scheduling.
#[derive(Debug)]
pub struct Ir {
    graphs: BTreeMap<GraphId, Graph>,
    dataflow: DataFlow,
    losses: Vec<Loss>,
    optimizer: Option<Sgd>,
    options: SessionOptions,
    counter: OpIdCounter,
    prepared: bool,
}

impl Ir {
    pub fn new(dataflow: DataFlow, options: SessionOptions) -> Self {
        ops::register_builtin_ops();
        let counter = OpIdCounter::default();
        let mut graphs = BTreeMap::new();
        graphs.insert(
            MAIN_GRAPH.to_string(),
            Graph::new(MAIN_GRAPH, None, counter.clone()),
        );
        Ir {
            graphs,
            dataflow,
            losses: Vec::new(),
            optimizer: None,
            options,
            counter,
            prepared: false,
        }
    }

    /// Builds an IR from a serialized ONNX ModelProto.
    pub fn from_onnx_bytes(
        bytes: &[u8],
        dataflow: DataFlow,
        options: SessionOptions,
    ) -> Result<Self> {
        let model = onnx::decode_model(bytes)?;
        Ir::from_model_proto(&model, dataflow, options)
    }

    /// Builds an IR from a decoded ModelProto: initializers become Variable
    /// tensors, non-initializer inputs become Streams, `Constant` nodes
    /// become Const tensors, and every other node becomes a catalog op.
    pub fn from_model_proto(
        model: &onnx::ModelProto,
        dataflow: DataFlow,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut ir = Ir::new(dataflow, options);
        let graph_proto = model.graph.as_ref().ok_or_else(|| {
            error!(ErrorKind::UnknownOperator, "model has no graph")
        })?;
        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == crate::op::ONNX_DOMAIN)
            .map(|o| o.version)
            .unwrap_or(9);
        if opset < 9 {
            warn!(opset, "model opset is older than the recommended minimum of 9");
        }
        info!(
            graph = graph_proto.name.as_str(),
            ir_version = model.ir_version,
            opset,
            "constructing IR from ONNX model"
        );

        let graph = ir.main_graph_mut();
        for init in &graph_proto.initializer {
            let info = onnx::tensor_info(init)?;
            let bytes = onnx::tensor_bytes(init)?;
            debug!(tensor = init.name.as_str(), "adding initializer");
            graph.tensors.add_variable(init.name.clone(), info, bytes)?;
        }
        for input in &graph_proto.input {
            if graph.tensors.contains(&input.name) {
                continue;
            }
            let info = onnx::value_info(input)?;
            debug!(tensor = input.name.as_str(), "adding stream input");
            graph.tensors.add_stream(input.name.clone(), info)?;
        }

        for (index, node) in graph_proto.node.iter().enumerate() {
            ir.grow_op_from_proto(node, index, opset)?;
        }
        Ok(ir)
    }

    fn grow_op_from_proto(
        &mut self,
        node: &onnx::NodeProto,
        index: usize,
        opset: i64,
    ) -> Result<()> {
        // Constant nodes carry their value as an attribute and materialize
        // directly as Const tensors rather than as ops.
        if node.op_type == "Constant" {
            let proto = node
                .attribute
                .iter()
                .find(|a| a.name == "value")
                .and_then(|a| a.t.as_ref())
                .ok_or_else(|| {
                    error!(
                        ErrorKind::UnknownAttribute,
                        "Constant node {} has no value attribute", node.name
                    )
                })?;
            let info = onnx::tensor_info(proto)?;
            let bytes = onnx::tensor_bytes(proto)?;
            let output = node.output.first().ok_or_else(|| {
                error!(ErrorKind::UnknownOperator, "Constant node {} has no output", node.name)
            })?;
            self.main_graph_mut()
                .tensors
                .add_const_init(output.clone(), info, bytes)?;
            return Ok(());
        }

        let operator = ops::resolve(&node.domain, &node.op_type, opset)?;
        let attrs = Attributes::from_protos(&node.attribute)?;
        let name = if node.name.is_empty() {
            format!("{}_{index}", node.op_type)
        } else {
            node.name.clone()
        };
        let graph = self.main_graph_mut();
        let op = graph.add_op(operator, attrs, OpSettings::named(name));
        for (input_index, tensor) in node.input.iter().enumerate() {
            if tensor.is_empty() {
                continue;
            }
            graph.connect_in(op, input_index, tensor)?;
        }
        for (output_index, tensor) in node.output.iter().enumerate() {
            if tensor.is_empty() {
                continue;
            }
            graph.create_and_connect_out(op, output_index, tensor)?;
        }
        graph.setup_op(op)?;
        Ok(())
    }

    pub fn main_graph(&self) -> &Graph {
        self.graphs
            .get(MAIN_GRAPH)
            .expect("the root graph always exists")
    }

    pub fn main_graph_mut(&mut self) -> &mut Graph {
        self.graphs
            .get_mut(MAIN_GRAPH)
            .expect("the root graph always exists")
    }

    pub fn graph(&self, id: &str) -> Result<&Graph> {
        self.graphs
            .get(id)
            .ok_or_else(|| error!(ErrorKind::DanglingConsumer, "no graph named {id}"))
    }

    pub fn graph_mut(&mut self, id: &str) -> Result<&mut Graph> {
        self.graphs
            .get_mut(id)
            .ok_or_else(|| error!(ErrorKind::DanglingConsumer, "no graph named {id}"))
    }

    /// Creates a sub-graph scoped under `parent`.
    pub fn create_subgraph(&mut self, id: impl Into<GraphId>, parent: &str) -> Result<&mut Graph> {
        let id = id.into();
        if self.graphs.contains_key(&id) {
            return Err(error!(
                ErrorKind::DuplicateProducer,
                "graph {id} already exists"
            ));
        }
        if !self.graphs.contains_key(parent) {
            return Err(error!(ErrorKind::DanglingConsumer, "no parent graph {parent}"));
        }
        let graph = Graph::new(id.clone(), Some(parent.to_string()), self.counter.clone());
        self.graphs.insert(id.clone(), graph);
        Ok(self.graphs.get_mut(&id).expect("just inserted"))
    }

    /// Captures `name` from a strict ancestor scope of `graph_id` as an
    /// input of that sub-graph. Names declared only in the graph itself, in
    /// siblings or in descendants are rejected.
    pub fn add_input_from_higher_scope(&mut self, graph_id: &str, name: &str) -> Result<TensorId> {
        let mut scope = self
            .graph(graph_id)?
            .parent
            .clone();
        let mut found: Option<(TensorClass, Option<TensorInfo>)> = None;
        while let Some(ancestor_id) = scope {
            let ancestor = self.graph(&ancestor_id)?;
            if ancestor.tensors.contains(name) {
                let tensor = ancestor.tensor(name)?;
                found = Some((tensor.class, tensor.info.clone()));
                break;
            }
            scope = ancestor.parent.clone();
        }
        let (_, info) = found.ok_or_else(|| {
            error!(
                ErrorKind::DanglingConsumer,
                "tensor {name} is not declared in any ancestor scope of {graph_id}"
            )
        })?;
        let graph = self.graph_mut(graph_id)?;
        let local: TensorId = name.to_string();
        match info {
            Some(info) => graph.tensors.add(TensorClass::ActGrad, local.clone(), info)?,
            None => graph.tensors.add_act_grad(local.clone())?,
        }
        graph.higher_scope_inputs.push(local.clone());
        Ok(local)
    }

    pub fn dataflow(&self) -> &DataFlow {
        &self.dataflow
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn losses(&self) -> &[Loss] {
        &self.losses
    }

    pub fn optimizer(&self) -> Option<&Sgd> {
        self.optimizer.as_ref()
    }

    pub fn add_loss(&mut self, loss: Loss) -> Result<()> {
        self.assert_mutable()?;
        self.losses.push(loss);
        Ok(())
    }

    pub fn set_optimizer(&mut self, optimizer: Sgd) -> Result<()> {
        if let Some(existing) = &self.optimizer {
            if self.prepared && !existing.valid_replacement(&optimizer) {
                return Err(error!(
                    ErrorKind::InternalLogicError,
                    "optimizer is not a valid replacement for the one compiled against"
                ));
            }
        }
        self.optimizer = Some(optimizer);
        Ok(())
    }

    /// Whether this compilation trains: losses plus an optimizer.
    pub fn can_train(&self) -> bool {
        !self.losses.is_empty() && self.optimizer.is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn assert_mutable(&self) -> Result<()> {
        if self.prepared {
            return Err(error!(
                ErrorKind::InternalLogicError,
                "the IR is frozen once prepared"
            ));
        }
        Ok(())
    }

    /// Grows the first-class loss ops declared in the loss specifications.
    /// Loss op attributes carry the per-loss scale so the gradient seeds
    /// absorb it.
    pub(crate) fn grow_loss_ops(&mut self) -> Result<Vec<OpId>> {
        let losses = self.losses.clone();
        let graph = self.main_graph_mut();
        let mut ops_grown = Vec::with_capacity(losses.len());
        for loss in &losses {
            if !graph.tensors.contains(&loss.input) {
                return Err(error!(
                    ErrorKind::UnreachableLoss,
                    "loss {} targets absent tensor {}", loss.name, loss.input
                ));
            }
            let mut attrs = Attributes::new()
                .with("scale", AttrValue::Float(loss.scale))
                .with("reduction", AttrValue::Str(loss.reduction.name().to_string()));
            let operator = match loss.kind {
                LossKind::L1 { lambda } => {
                    attrs.set("lambda", AttrValue::Float(lambda));
                    catalog::L1
                }
                LossKind::Nll => catalog::NLL,
                LossKind::Identity => catalog::IDENTITY_LOSS,
            };
            let op = graph.add_op(operator, attrs, OpSettings::named(loss.name.clone()));
            graph.connect_in(op, 0, &loss.input)?;
            if let Some(label) = &loss.label {
                graph.connect_in(op, 1, label)?;
            }
            graph.create_and_connect_out(op, 0, &loss.name)?;
            graph.setup_op(op)?;
            ops_grown.push(op);
        }
        Ok(ops_grown)
    }

    /// Runs the full preparation pipeline: losses, autodiff when training,
    /// the transform pipeline with its pattern-rewriter interleavings, and
    /// a final schedule validation. After this the IR is frozen.
    pub fn prepare(&mut self) -> Result<()> {
        self.assert_mutable()?;
        self.grow_loss_ops()?;
        crate::patterns::apply_pre_alias(self.main_graph_mut())?;

        if self.can_train() {
            crate::autodiff::grow_backward(self)?;
            crate::patterns::apply_pre_alias(self.main_graph_mut())?;
        }

        crate::transforms::run_pipeline(self)?;

        let schedule = scheduler::op_schedule(self.main_graph())?;
        debug!(ops = schedule.len(), "final schedule validated");
        self.main_graph().verify()?;
        self.prepared = true;
        Ok(())
    }

    /// The deterministic total order of the prepared root graph.
    pub fn op_schedule(&self) -> Result<Vec<OpId>> {
        scheduler::op_schedule(self.main_graph())
    }

    /// Read/write surface over persistent Variable tensors.
    pub fn weights_io(&mut self) -> WeightsIo<'_> {
        WeightsIo { ir: self }
    }
}

/// Host access to Variable tensor state. The byte layout must match the
/// tensor's declared info; no other format is prescribed.
pub struct WeightsIo<'a> {
    ir: &'a mut Ir,
}

impl<'a> WeightsIo<'a> {
    pub fn contains(&self, id: &str) -> bool {
        self.ir
            .main_graph()
            .tensors
            .get(id)
            .map(|t| t.class == TensorClass::Variable)
            .unwrap_or(false)
    }

    pub fn weight(&self, id: &str) -> Result<(&TensorInfo, &[u8])> {
        let tensor = self.ir.main_graph().tensor(id)?;
        if tensor.class != TensorClass::Variable {
            return Err(error!(
                ErrorKind::DanglingConsumer,
                "tensor {id} is not a Variable"
            ));
        }
        let info = tensor.info()?;
        let data = tensor
            .data()
            .ok_or_else(|| error!(ErrorKind::MissingProducer, "weight {id} carries no bytes"))?;
        Ok((info, data.data()))
    }

    pub fn write(&mut self, id: &str, bytes: &[u8]) -> Result<()> {
        let tensor = self.ir.main_graph_mut().tensor_mut(id)?;
        if tensor.class != TensorClass::Variable {
            return Err(error!(
                ErrorKind::DanglingConsumer,
                "tensor {id} is not a Variable"
            ));
        }
        let expected = tensor.info()?.nbytes().unwrap_or(-1);
        if bytes.len() as i64 != expected {
            return Err(error!(
                ErrorKind::ShapeMismatch,
                "weight {id} write of {} bytes, info requires {expected}",
                bytes.len()
            ));
        }
        match tensor.data_mut() {
            Some(data) => data.data_mut().copy_from_slice(bytes),
            None => {
                return Err(error!(
                    ErrorKind::MissingProducer,
                    "weight {id} carries no bytes"
                ))
            }
        }
        Ok(())
    }
}
