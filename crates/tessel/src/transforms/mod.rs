//! Whole-graph structural transforms and the fixed-order pipeline driver.

mod batchserialize;
mod constfold;
mod mergevarupdates;
mod pipeline;
mod prune;
mod recompute;

use tracing::debug;

use crate::error::Result;
use crate::ir::{Ir, MergeVarUpdatePolicy};

pub use batchserialize::BatchSerialize;
pub use constfold::ConstExprFold;
pub use mergevarupdates::MergeVarUpdates;
pub use pipeline::Pipeline;
pub use prune::Prune;
pub use recompute::{grow_recompute_clones, RecomputeTag};

/// One whole-graph transform. `apply` returns whether the IR changed;
/// transforms recover nothing locally and raise on the first violated
/// invariant.
pub trait Transform {
    fn name(&self) -> &'static str;
    fn apply(&self, ir: &mut Ir) -> Result<bool>;
}

/// Runs the standard transform pipeline in its fixed order, re-running the
/// pattern rewriter between the structural steps and finishing with the
/// alias/inplace sweep.
pub fn run_pipeline(ir: &mut Ir) -> Result<()> {
    let mut steps: Vec<Box<dyn Transform>> = vec![Box::new(ConstExprFold), Box::new(Prune)];
    if ir.can_train() {
        // Always offered a chance to run: user recompute annotations are
        // honored even with no automatic strategy selected.
        steps.push(Box::new(RecomputeTag));
    }
    if ir.options().merge_var_update != MergeVarUpdatePolicy::None {
        steps.push(Box::new(MergeVarUpdates));
    }
    if ir.options().enable_pipelining {
        steps.push(Box::new(Pipeline));
    }
    if ir.options().batch_serialization_factor > 1 {
        steps.push(Box::new(BatchSerialize::pass1()));
        steps.push(Box::new(BatchSerialize::pass2()));
    }

    for step in &steps {
        let changed = step.apply(ir)?;
        debug!(transform = step.name(), changed, "transform applied");
        if changed {
            crate::patterns::apply_pre_alias(ir.main_graph_mut())?;
        }
    }

    if ir.can_train() {
        let grown = grow_recompute_clones(ir.main_graph_mut())?;
        if grown > 0 {
            debug!(clones = grown, "recompute clones grown");
        }
    }

    // Structural duplication has settled; decide in-place variants last.
    let dataflow = ir.dataflow().clone();
    crate::patterns::apply_inplace(ir.main_graph_mut(), &dataflow)?;
    Ok(())
}
