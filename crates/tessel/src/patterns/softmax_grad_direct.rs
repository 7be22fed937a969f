//! Fuses the NLL-gradient / softmax-gradient chain into a single op.
//!
//! The backward pass of `Nll(Softmax(x), label)` first produces
//! `dL/dprobs` (NllGrad) and then pulls it through SoftmaxGrad. The fused
//! form computes `probs - onehot(label)` in one step, which is both cheaper
//! and numerically tighter.

use crate::error::Result;
use crate::graph::Graph;
use crate::op::{Op, OpId};
use crate::ops::catalog;
use crate::patterns::{erase_if_unconsumed, replace_op, Pattern};
use crate::tensor::TensorId;

pub struct SoftmaxGradDirect;

impl SoftmaxGradDirect {
    /// The NllGrad producing this SoftmaxGrad's incoming gradient, if the
    /// chain matches and the intermediate gradient has no other consumer.
    fn nll_grad_of(op: &Op, graph: &Graph) -> Result<Option<OpId>> {
        if op.operator != catalog::SOFTMAX_GRAD {
            return Ok(None);
        }
        let grad_in = graph.tensor(op.input(0)?)?;
        let Some(producer) = grad_in.producer else {
            return Ok(None);
        };
        if graph.op(producer)?.operator != catalog::NLL_GRAD {
            return Ok(None);
        }
        if grad_in.consumers.total() != 1 {
            return Ok(None);
        }
        Ok(Some(producer))
    }
}

impl Pattern for SoftmaxGradDirect {
    fn name(&self) -> &'static str {
        "SoftmaxGradDirect"
    }

    fn matches(&self, op: &Op, graph: &Graph) -> Result<bool> {
        Ok(Self::nll_grad_of(op, graph)?.is_some())
    }

    fn touches(&self, op: &Op, graph: &Graph) -> Result<Vec<TensorId>> {
        let nll_grad = Self::nll_grad_of(op, graph)?
            .ok_or_else(|| crate::error::Error::internal("touches called without a match"))?;
        let nll = graph.op(nll_grad)?;
        Ok(vec![
            op.input(0)?.clone(),
            op.output(0)?.clone(),
            nll.input(0)?.clone(),
            nll.input(1)?.clone(),
        ])
    }

    fn apply(&self, op: OpId, graph: &mut Graph) -> Result<bool> {
        let Some(nll_grad) = Self::nll_grad_of(graph.op(op)?, graph)? else {
            return Ok(false);
        };
        let probs = graph.op(nll_grad)?.input(0)?.clone();
        let label = graph.op(nll_grad)?.input(1)?.clone();
        let attrs = graph.op(nll_grad)?.attrs.clone();
        replace_op(
            graph,
            op,
            catalog::SOFTMAX_GRAD_DIRECT,
            attrs,
            &[probs, label],
        )?;
        erase_if_unconsumed(graph, nll_grad)?;
        Ok(true)
    }
}
