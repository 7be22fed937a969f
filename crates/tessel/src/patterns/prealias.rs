//! Algebraic pre-alias patterns: unary-sum and zero-pad removal, shape-only
//! ops resolved to identity, and the negate/subtract swap.

use crate::attributes::Attributes;
use crate::error::Result;
use crate::graph::Graph;
use crate::op::{Op, OpId};
use crate::ops::catalog;
use crate::patterns::{erase_if_unconsumed, replace_op, Pattern};
use crate::tensor::TensorId;

/// A Sum with a single input and a Pad with all-zero pads compute nothing;
/// both collapse to Identity.
pub struct PreUniRepl;

impl Pattern for PreUniRepl {
    fn name(&self) -> &'static str {
        "PreUniRepl"
    }

    fn matches(&self, op: &Op, _graph: &Graph) -> Result<bool> {
        if op.operator == catalog::SUM {
            return Ok(op.n_inputs() == 1);
        }
        if op.operator == catalog::PAD {
            return Ok(op.attrs.ints("pads")?.iter().all(|&p| p == 0));
        }
        Ok(false)
    }

    fn touches(&self, op: &Op, _graph: &Graph) -> Result<Vec<TensorId>> {
        Ok(vec![op.input(0)?.clone(), op.output(0)?.clone()])
    }

    fn apply(&self, op: OpId, graph: &mut Graph) -> Result<bool> {
        let input = graph.op(op)?.input(0)?.clone();
        replace_op(graph, op, catalog::IDENTITY, Attributes::new(), &[input])?;
        Ok(true)
    }
}

/// Shape-only ops whose output equals their input elementwise: a reshape or
/// flatten to the same shape, or a transpose with the identity permutation.
pub struct OpToIdentity;

impl Pattern for OpToIdentity {
    fn name(&self) -> &'static str {
        "OpToIdentity"
    }

    fn matches(&self, op: &Op, graph: &Graph) -> Result<bool> {
        if op.operator == catalog::TRANSPOSE {
            let rank = graph.tensor_info(op.input(0)?)?.rank();
            let perm = op.attrs.ints_or_empty("perm")?;
            return Ok(!perm.is_empty()
                && perm.iter().copied().eq(0..rank as i64));
        }
        if op.operator == catalog::RESHAPE || op.operator == catalog::FLATTEN {
            let t_in = graph.tensor(op.input(0)?)?;
            let t_out = graph.tensor(op.output(0)?)?;
            if let (Ok(in_info), Ok(out_info)) = (t_in.info(), t_out.info()) {
                return Ok(in_info.shape() == out_info.shape());
            }
        }
        Ok(false)
    }

    fn touches(&self, op: &Op, _graph: &Graph) -> Result<Vec<TensorId>> {
        Ok(vec![op.input(0)?.clone(), op.output(0)?.clone()])
    }

    fn apply(&self, op: OpId, graph: &mut Graph) -> Result<bool> {
        let input = graph.op(op)?.input(0)?.clone();
        replace_op(graph, op, catalog::IDENTITY, Attributes::new(), &[input])?;
        Ok(true)
    }
}

/// `Sub(a, Neg(b))` is `Add(a, b)`: the negation disappears into the
/// subtraction swap.
pub struct NegSubToSubSwap;

impl Pattern for NegSubToSubSwap {
    fn name(&self) -> &'static str {
        "NegSubToSubSwap"
    }

    fn matches(&self, op: &Op, graph: &Graph) -> Result<bool> {
        if op.operator != catalog::SUB {
            return Ok(false);
        }
        let rhs = graph.tensor(op.input(1)?)?;
        let Some(producer) = rhs.producer else {
            return Ok(false);
        };
        Ok(graph.op(producer)?.operator == catalog::NEG)
    }

    fn touches(&self, op: &Op, graph: &Graph) -> Result<Vec<TensorId>> {
        let rhs = op.input(1)?.clone();
        let neg = graph.tensor(&rhs)?.producer()?;
        let negated = graph.op(neg)?.input(0)?.clone();
        Ok(vec![op.input(0)?.clone(), rhs, negated, op.output(0)?.clone()])
    }

    fn apply(&self, op: OpId, graph: &mut Graph) -> Result<bool> {
        let lhs = graph.op(op)?.input(0)?.clone();
        let rhs = graph.op(op)?.input(1)?.clone();
        let neg = graph.tensor(&rhs)?.producer()?;
        let negated = graph.op(neg)?.input(0)?.clone();
        replace_op(graph, op, catalog::ADD, Attributes::new(), &[lhs, negated])?;
        erase_if_unconsumed(graph, neg)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttrValue;
    use crate::dtype::DType;
    use crate::graph::{OpIdCounter, MAIN_GRAPH};
    use crate::op::OpSettings;
    use crate::shape::TensorInfo;

    fn graph() -> Graph {
        crate::ops::register_builtin_ops();
        Graph::new(MAIN_GRAPH, None, OpIdCounter::default())
    }

    #[test]
    fn unary_sum_collapses_to_identity() {
        let mut g = graph();
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![4]))
            .unwrap();
        let sum = g.add_op(catalog::SUM, Attributes::new(), OpSettings::default());
        g.connect_in(sum, 0, "x").unwrap();
        g.create_and_connect_out(sum, 0, "y").unwrap();
        g.setup_op(sum).unwrap();

        assert!(crate::patterns::apply_pre_alias(&mut g).unwrap());
        let producer = g.tensor("y").unwrap().producer().unwrap();
        assert_eq!(g.op(producer).unwrap().operator, catalog::IDENTITY);
        g.verify().unwrap();
    }

    #[test]
    fn sub_of_negation_becomes_add() {
        let mut g = graph();
        for id in ["a", "b"] {
            g.tensors
                .add_stream(id, TensorInfo::new(DType::Float32, vec![4]))
                .unwrap();
        }
        let neg = g.add_op(catalog::NEG, Attributes::new(), OpSettings::default());
        g.connect_in(neg, 0, "b").unwrap();
        g.create_and_connect_out(neg, 0, "neg_b").unwrap();
        g.setup_op(neg).unwrap();
        let sub = g.add_op(catalog::SUB, Attributes::new(), OpSettings::default());
        g.connect_in(sub, 0, "a").unwrap();
        g.connect_in(sub, 1, "neg_b").unwrap();
        g.create_and_connect_out(sub, 0, "out").unwrap();
        g.setup_op(sub).unwrap();

        assert!(crate::patterns::apply_pre_alias(&mut g).unwrap());
        let producer = g.tensor("out").unwrap().producer().unwrap();
        let add = g.op(producer).unwrap();
        assert_eq!(add.operator, catalog::ADD);
        assert_eq!(add.input(1).unwrap(), "b");
        // The negation became dead and was erased with its output.
        assert!(!g.tensors.contains("neg_b"));
        g.verify().unwrap();
    }

    #[test]
    fn identity_permutation_transpose_is_removed() {
        let mut g = graph();
        g.tensors
            .add_stream("x", TensorInfo::new(DType::Float32, vec![2, 3]))
            .unwrap();
        let transpose = g.add_op(
            catalog::TRANSPOSE,
            Attributes::new().with("perm", AttrValue::Ints(vec![0, 1])),
            OpSettings::default(),
        );
        g.connect_in(transpose, 0, "x").unwrap();
        g.create_and_connect_out(transpose, 0, "y").unwrap();
        g.setup_op(transpose).unwrap();

        assert!(crate::patterns::apply_pre_alias(&mut g).unwrap());
        let producer = g.tensor("y").unwrap().producer().unwrap();
        assert_eq!(g.op(producer).unwrap().operator, catalog::IDENTITY);
    }
}
