//! SGD optimizer: atomic scalars, host-computed compound scalars and
//! var-update op synthesis.
//!
//! Scalar derivation, for the record (non-Nesterov SGD with loss scaling
//! `ls`, velocity scaling `vs` and replication `rf`):
//!
//! ```text
//! in-loop   : v <- v + (1 - dm) * vs * rf / ls * g_i
//! out-of-loop: v <- v / rf            (after the cross-replica reduce)
//!              w <- w - lr / vs * v
//!              v <- v * mm + (1 - dm) * wd * vs * w
//! ```
//!
//! With no momentum and no accumulation there is no persistent velocity and
//! the update collapses to a single op:
//!
//! ```text
//! w <- w * (1 - lr * (1 - dm) * wd) - g * (lr * (1 - dm) / ls)
//! ```

use std::collections::BTreeMap;

use crate::attributes::{AttrValue, Attributes};
use crate::dtype::DType;
use crate::error::{error, ErrorKind, Result};
use crate::graph::Graph;
use crate::op::{OpId, OpSettings};
use crate::ops::catalog;
use crate::shape::TensorInfo;
use crate::tensor::{reserved, TensorClass, TensorId};

/// One atomic optimizer scalar: a value and whether it is fixed for the
/// lifetime of the compiled program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerValue {
    pub val: f32,
    pub is_const: bool,
}

impl OptimizerValue {
    pub const fn new(val: f32, is_const: bool) -> Self {
        OptimizerValue { val, is_const }
    }

    pub const fn constant(val: f32) -> Self {
        OptimizerValue::new(val, true)
    }
}

impl From<(f32, bool)> for OptimizerValue {
    fn from((val, is_const): (f32, bool)) -> Self {
        OptimizerValue::new(val, is_const)
    }
}

/// Per-weight overrides of the tensor-specific atomic scalars.
#[derive(Debug, Clone, Copy)]
pub struct SgdValues {
    pub lr: OptimizerValue,
    pub wd: OptimizerValue,
    pub mm: OptimizerValue,
    pub dm: OptimizerValue,
    pub vs: OptimizerValue,
}

/// Stochastic gradient descent with optional momentum, dampening, weight
/// decay, velocity scaling, loss scaling and replication.
#[derive(Debug, Clone)]
pub struct Sgd {
    defaults: SgdValues,
    /// Loss scaling is global, never tensor-specific.
    ls: OptimizerValue,
    /// Replication factor is global, never tensor-specific.
    rf: OptimizerValue,
    specific: BTreeMap<TensorId, SgdValues>,
}

impl Default for Sgd {
    fn default() -> Self {
        Sgd {
            defaults: SgdValues {
                lr: OptimizerValue::constant(0.1),
                wd: OptimizerValue::constant(0.0),
                mm: OptimizerValue::constant(0.0),
                dm: OptimizerValue::constant(0.0),
                vs: OptimizerValue::constant(1.0),
            },
            ls: OptimizerValue::constant(1.0),
            rf: OptimizerValue::constant(1.0),
            specific: BTreeMap::new(),
        }
    }
}

impl Sgd {
    pub fn new(
        lr: impl Into<OptimizerValue>,
        wd: impl Into<OptimizerValue>,
        mm: impl Into<OptimizerValue>,
        dm: impl Into<OptimizerValue>,
        vs: impl Into<OptimizerValue>,
        ls: impl Into<OptimizerValue>,
    ) -> Result<Self> {
        let sgd = Sgd {
            defaults: SgdValues {
                lr: lr.into(),
                wd: wd.into(),
                mm: mm.into(),
                dm: dm.into(),
                vs: vs.into(),
            },
            ls: ls.into(),
            rf: OptimizerValue::constant(1.0),
            specific: BTreeMap::new(),
        };
        sgd.check_values(&sgd.defaults)?;
        Ok(sgd)
    }

    /// SGD with every scalar constant; the historical convenience form.
    pub fn const_sgd(lr: f32, wd: f32, ls: f32) -> Self {
        Sgd::new(
            OptimizerValue::constant(lr),
            OptimizerValue::constant(wd),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(1.0),
            OptimizerValue::constant(ls),
        )
        .expect("constant scalars are always valid")
    }

    pub fn with_replication(mut self, rf: impl Into<OptimizerValue>) -> Self {
        self.rf = rf.into();
        self
    }

    /// Overrides atomic scalars for one weight tensor.
    pub fn insert_specific(&mut self, id: impl Into<TensorId>, values: SgdValues) -> Result<()> {
        self.check_values(&values)?;
        self.specific.insert(id.into(), values);
        Ok(())
    }

    fn check_values(&self, values: &SgdValues) -> Result<()> {
        if values.lr.val <= 0.0 {
            return Err(error!(
                ErrorKind::InternalLogicError,
                "learning rate must be positive, got {}",
                values.lr.val
            ));
        }
        if values.vs.val == 0.0 {
            return Err(error!(
                ErrorKind::InternalLogicError,
                "velocity scaling must be non-zero"
            ));
        }
        Ok(())
    }

    fn values(&self, id: &str) -> SgdValues {
        self.specific.get(id).copied().unwrap_or(self.defaults)
    }

    pub fn loss_scaling(&self) -> OptimizerValue {
        self.ls
    }

    pub fn replication(&self) -> OptimizerValue {
        self.rf
    }

    /// Velocity state is needed when there is momentum, or when gradient
    /// accumulation keeps partial sums across micro-batches.
    pub fn requires_accl(&self, id: &str, accumulation_enabled: bool) -> bool {
        self.values(id).mm.val != 0.0 || accumulation_enabled
    }

    // Compound scalars. Each is Const iff all its constituents are Const.

    /// `1 - lr * (1 - dm) * wd`
    pub fn weight_decay_scale_factor0(&self, id: &str) -> OptimizerValue {
        let v = self.values(id);
        OptimizerValue {
            val: 1.0 - v.lr.val * (1.0 - v.dm.val) * v.wd.val,
            is_const: v.lr.is_const && v.dm.is_const && v.wd.is_const,
        }
    }

    /// `lr * (1 - dm) / ls`
    pub fn scaled_learning_rate0(&self, id: &str) -> OptimizerValue {
        let v = self.values(id);
        OptimizerValue {
            val: v.lr.val * (1.0 - v.dm.val) / self.ls.val,
            is_const: v.lr.is_const && v.dm.is_const && self.ls.is_const,
        }
    }

    /// `lr / vs`
    pub fn scaled_learning_rate1(&self, id: &str) -> OptimizerValue {
        let v = self.values(id);
        OptimizerValue {
            val: v.lr.val / v.vs.val,
            is_const: v.lr.is_const && v.vs.is_const,
        }
    }

    /// `(1 - dm) * wd * vs`
    pub fn weight_decay_scale_factor1(&self, id: &str) -> OptimizerValue {
        let v = self.values(id);
        OptimizerValue {
            val: (1.0 - v.dm.val) * v.wd.val * v.vs.val,
            is_const: v.dm.is_const && v.wd.is_const && v.vs.is_const,
        }
    }

    /// `(1 - dm) * vs * rf / ls`
    pub fn dampening_scale_factor1(&self, id: &str) -> OptimizerValue {
        let v = self.values(id);
        OptimizerValue {
            val: (1.0 - v.dm.val) * v.vs.val * self.rf.val / self.ls.val,
            is_const: v.dm.is_const && v.vs.is_const && self.rf.is_const && self.ls.is_const,
        }
    }

    /// `mm`
    pub fn momentum1(&self, id: &str) -> OptimizerValue {
        self.values(id).mm
    }

    /// Whether a graph built against this optimizer can be driven by
    /// `other` without recompilation: const scalars must stay const with
    /// the same value, non-const must stay non-const.
    pub fn valid_replacement(&self, other: &Sgd) -> bool {
        fn compatible(a: OptimizerValue, b: OptimizerValue) -> bool {
            a.is_const == b.is_const && (!a.is_const || a.val == b.val)
        }
        let same_defaults = compatible(self.defaults.lr, other.defaults.lr)
            && compatible(self.defaults.wd, other.defaults.wd)
            && compatible(self.defaults.mm, other.defaults.mm)
            && compatible(self.defaults.dm, other.defaults.dm)
            && compatible(self.defaults.vs, other.defaults.vs)
            && compatible(self.ls, other.ls)
            && compatible(self.rf, other.rf);
        same_defaults
            && self.specific.len() == other.specific.len()
            && self.specific.iter().all(|(id, a)| {
                other.specific.get(id).is_some_and(|b| {
                    compatible(a.lr, b.lr)
                        && compatible(a.wd, b.wd)
                        && compatible(a.mm, b.mm)
                        && compatible(a.dm, b.dm)
                        && compatible(a.vs, b.vs)
                })
            })
    }

    /// Grows the var-update op(s) for one weight whose gradient has been
    /// produced. Returns the created op ids, update step last.
    pub fn grow_var_update(
        &self,
        graph: &mut Graph,
        weight: &str,
        grad: &str,
        accumulation_enabled: bool,
    ) -> Result<Vec<OpId>> {
        if self.requires_accl(weight, accumulation_enabled) {
            self.grow_sgd1(graph, weight, grad)
        } else {
            self.grow_sgd0(graph, weight, grad)
        }
    }

    fn grow_sgd0(&self, graph: &mut Graph, weight: &str, grad: &str) -> Result<Vec<OpId>> {
        let mut attrs = Attributes::new();
        let update = graph.add_op(
            catalog::SGD0_VAR_UPDATE,
            Attributes::new(),
            OpSettings::named(format!("sgd0_{weight}")),
        );
        graph.connect_in(update, 0, weight)?;
        graph.connect_in(update, 1, grad)?;
        let mut next_input = 2;
        for (prefix, attr, value) in [
            (
                reserved::SCALED_LEARNING_RATE_0_PREFIX,
                "slr0",
                self.scaled_learning_rate0(weight),
            ),
            (
                reserved::WEIGHT_DECAY_SCALE_FACTOR_0_PREFIX,
                "wdsf0",
                self.weight_decay_scale_factor0(weight),
            ),
        ] {
            if value.is_const {
                attrs.set(attr, AttrValue::Float(value.val));
            } else {
                let id = scalar_stream(graph, prefix, weight)?;
                graph.connect_in(update, next_input, &id)?;
                next_input += 1;
            }
        }
        graph.op_mut(update)?.attrs = attrs;
        graph.create_and_connect_out(update, 0, &reserved::updated_id(weight))?;
        graph.setup_op(update)?;
        impose_update_last(graph, weight, update)?;
        Ok(vec![update])
    }

    fn grow_sgd1(&self, graph: &mut Graph, weight: &str, grad: &str) -> Result<Vec<OpId>> {
        let accl = reserved::accl_id(weight);
        if !graph.tensors.contains(&accl) {
            let info = graph.tensor_info(weight)?.clone();
            let nbytes = info.nbytes().ok_or_else(|| {
                error!(
                    ErrorKind::TypeMismatch,
                    "weight {weight} has no fixed-width element type"
                )
            })? as usize;
            graph
                .tensors
                .add_with_data(TensorClass::Momentum, accl.clone(), info, vec![0u8; nbytes])?;
        }

        // In-loop accumulation: v <- v + dpsf1 * g per micro-batch.
        let mut accum_attrs = Attributes::new();
        let accumulate = graph.add_op(
            catalog::SGD1_ACCUMULATE,
            Attributes::new(),
            OpSettings::named(format!("sgd1_accl_{weight}")),
        );
        graph.connect_in(accumulate, 0, &accl)?;
        graph.connect_in(accumulate, 1, grad)?;
        let dpsf1 = self.dampening_scale_factor1(weight);
        if dpsf1.is_const {
            accum_attrs.set("dpsf1", AttrValue::Float(dpsf1.val));
        } else {
            let id = scalar_stream(graph, reserved::DAMPENING_SCALE_FACTOR_1_PREFIX, weight)?;
            graph.connect_in(accumulate, 2, &id)?;
        }
        graph.op_mut(accumulate)?.attrs = accum_attrs;
        let accumulated = reserved::updated_id(&accl);
        graph.create_and_connect_out(accumulate, 0, &accumulated)?;
        graph.setup_op(accumulate)?;

        // Out-of-loop step, sequenced as: cross-replica reduce, v / rf,
        // weight update, then velocity decay.
        let mut step_attrs =
            Attributes::new().with("rf", AttrValue::Float(self.rf.val));
        let step = graph.add_op(
            catalog::SGD1_VAR_UPDATE,
            Attributes::new(),
            OpSettings::named(format!("sgd1_step_{weight}")),
        );
        graph.connect_in(step, 0, weight)?;
        graph.connect_in(step, 1, &accumulated)?;
        let mut next_input = 2;
        for (prefix, attr, value) in [
            (
                reserved::SCALED_LEARNING_RATE_1_PREFIX,
                "slr1",
                self.scaled_learning_rate1(weight),
            ),
            (
                reserved::WEIGHT_DECAY_SCALE_FACTOR_1_PREFIX,
                "wdsf1",
                self.weight_decay_scale_factor1(weight),
            ),
            (reserved::MOMENTUM_1_PREFIX, "mm1", self.momentum1(weight)),
        ] {
            if value.is_const {
                step_attrs.set(attr, AttrValue::Float(value.val));
            } else {
                let id = scalar_stream(graph, prefix, weight)?;
                graph.connect_in(step, next_input, &id)?;
                next_input += 1;
            }
        }
        graph.op_mut(step)?.attrs = step_attrs;
        graph.create_and_connect_out(step, 0, &reserved::updated_id(weight))?;
        graph.create_and_connect_out(step, 1, &format!("{accl}___decayed"))?;
        graph.setup_op(step)?;
        impose_update_last(graph, weight, step)?;
        Ok(vec![accumulate, step])
    }
}

/// Adds (once) the streamed host tensor backing a non-const compound scalar.
fn scalar_stream(graph: &mut Graph, prefix: &str, weight: &str) -> Result<TensorId> {
    let id = format!("{prefix}{weight}");
    if !graph.tensors.contains(&id) {
        graph
            .tensors
            .add_stream(id.clone(), TensorInfo::new(DType::Float32, Vec::<i64>::new()))?;
    }
    Ok(id)
}

/// The update must be the topologically last consumer of the weight: every
/// other consumer reads the pre-update value.
fn impose_update_last(graph: &mut Graph, weight: &str, update: OpId) -> Result<()> {
    let consumers = graph.tensor(weight)?.consumers.ops();
    for consumer in consumers {
        if consumer != update {
            graph.topo_cons.insert(consumer, update)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd0_compound_scalars() {
        let sgd = Sgd::new(
            OptimizerValue::constant(0.1),
            OptimizerValue::constant(0.02),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(0.25),
            OptimizerValue::constant(1.0),
            OptimizerValue::constant(8.0),
        )
        .unwrap();
        let wdsf0 = sgd.weight_decay_scale_factor0("w");
        let slr0 = sgd.scaled_learning_rate0("w");
        assert!((wdsf0.val - (1.0 - 0.1 * 0.75 * 0.02)).abs() < 1e-7);
        assert!((slr0.val - 0.1 * 0.75 / 8.0).abs() < 1e-7);
        assert!(wdsf0.is_const && slr0.is_const);
    }

    #[test]
    fn sgd1_compound_scalars_and_constness() {
        let sgd = Sgd::new(
            OptimizerValue::new(0.1, false),
            OptimizerValue::constant(0.01),
            OptimizerValue::constant(0.9),
            OptimizerValue::constant(0.1),
            OptimizerValue::constant(2.0),
            OptimizerValue::constant(4.0),
        )
        .unwrap()
        .with_replication(OptimizerValue::constant(2.0));

        let slr1 = sgd.scaled_learning_rate1("w");
        assert!((slr1.val - 0.1 / 2.0).abs() < 1e-7);
        // lr is non-const, so the compound scalar it feeds is non-const.
        assert!(!slr1.is_const);

        let wdsf1 = sgd.weight_decay_scale_factor1("w");
        assert!((wdsf1.val - 0.9 * 0.01 * 2.0).abs() < 1e-7);
        assert!(wdsf1.is_const);

        let dpsf1 = sgd.dampening_scale_factor1("w");
        assert!((dpsf1.val - 0.9 * 2.0 * 2.0 / 4.0).abs() < 1e-7);
        assert!(dpsf1.is_const);

        assert_eq!(sgd.momentum1("w").val, 0.9);
        assert!(sgd.requires_accl("w", false));
    }

    #[test]
    fn tensor_specific_values_override_defaults() {
        let mut sgd = Sgd::const_sgd(0.1, 0.0, 1.0);
        sgd.insert_specific(
            "w",
            SgdValues {
                lr: OptimizerValue::constant(0.5),
                wd: OptimizerValue::constant(0.0),
                mm: OptimizerValue::constant(0.0),
                dm: OptimizerValue::constant(0.0),
                vs: OptimizerValue::constant(1.0),
            },
        )
        .unwrap();
        assert!((sgd.scaled_learning_rate0("w").val - 0.5).abs() < 1e-7);
        assert!((sgd.scaled_learning_rate0("other").val - 0.1).abs() < 1e-7);
    }

    #[test]
    fn replacement_requires_matching_constness() {
        let a = Sgd::const_sgd(0.1, 0.0, 1.0);
        let b = Sgd::const_sgd(0.1, 0.0, 1.0);
        assert!(a.valid_replacement(&b));
        let c = Sgd::const_sgd(0.2, 0.0, 1.0);
        assert!(!a.valid_replacement(&c));
        let d = Sgd::new(
            OptimizerValue::new(0.1, false),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(0.0),
            OptimizerValue::constant(1.0),
            OptimizerValue::constant(1.0),
        )
        .unwrap();
        assert!(!a.valid_replacement(&d));
        // Non-const scalars may change value without recompilation.
        let mut e = d.clone();
        e.defaults.lr.val = 0.9;
        assert!(d.valid_replacement(&e));
    }
}
