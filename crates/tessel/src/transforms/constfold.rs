//! Constant-expression folding: ops whose inputs are all Const are
//! evaluated at compile time and replaced by Const tensors.

use tracing::debug;

use crate::error::Result;
use crate::ir::Ir;
use crate::ops::{self, FoldCtx};
use crate::scheduler;
use crate::shape::TensorInfo;
use crate::tensor::{TensorClass, TensorData};
use crate::transforms::Transform;

pub struct ConstExprFold;

impl Transform for ConstExprFold {
    fn name(&self) -> &'static str {
        "ConstExprFold"
    }

    fn apply(&self, ir: &mut Ir) -> Result<bool> {
        let graph = ir.main_graph_mut();
        let mut changed_any = false;
        // Iterating in schedule order folds chains in one sweep; repeat
        // until a sweep folds nothing so rewired subtrees settle.
        loop {
            let mut changed = false;
            for op_id in scheduler::op_schedule(graph)? {
                if !graph.has_op(op_id) {
                    continue;
                }
                let op = graph.op(op_id)?.clone();
                let def = ops::opdef(&op.operator)?;
                // A kernel that is missing for a const-only subtree leaves
                // the subtree intact.
                let Some(fold) = def.fold else {
                    continue;
                };
                if op.n_outputs() != 1 || op.n_inputs() == 0 {
                    continue;
                }

                let mut inputs: Vec<(TensorInfo, Vec<u8>)> = Vec::with_capacity(op.n_inputs());
                let mut all_const = true;
                for (_, tensor) in op.inputs() {
                    let t = graph.tensor(tensor)?;
                    match (t.class, t.data()) {
                        (TensorClass::Const, Some(data)) => {
                            inputs.push((t.info()?.clone(), data.data().to_vec()));
                        }
                        _ => {
                            all_const = false;
                            break;
                        }
                    }
                }
                if !all_const {
                    continue;
                }

                let output = op.output(0)?.clone();
                let out_info = graph.tensor_info(&output)?.clone();
                let ctx = FoldCtx {
                    op: &op,
                    inputs: inputs
                        .iter()
                        .map(|(info, bytes)| (info, bytes.as_slice()))
                        .collect(),
                    out_info: &out_info,
                };
                let bytes = (fold)(&ctx)?;
                if Some(bytes.len() as i64) != out_info.nbytes() {
                    return Err(crate::error::Error::internal(format!(
                        "const-expr kernel for {} produced {} bytes, info {out_info} requires {:?}",
                        op.debug_name(),
                        bytes.len(),
                        out_info.nbytes()
                    )));
                }

                debug!(op = op.debug_name().as_str(), "folding constant expression");
                graph.erase_op(op_id)?;
                let tensor = graph.tensor_mut(&output)?;
                tensor.class = TensorClass::Const;
                tensor.data = Some(TensorData::new(bytes));
                // Inputs now without consumers are swept by pruning.
                changed = true;
                changed_any = true;
            }
            if !changed {
                break;
            }
        }
        Ok(changed_any)
    }
}
