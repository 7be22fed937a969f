//! Host data-flow policy: batches per step and anchored tensors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{error, ErrorKind, Result};
use crate::tensor::TensorId;

/// How often an anchored tensor is returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorReturnType {
    /// Every batch in the step.
    All,
    /// Only the final batch.
    Final,
    /// Every `n`-th batch.
    EveryN(u32),
    /// The sum over the step's batches.
    Sum,
}

/// The data-flow policy of one compilation: which tensors are copied back
/// to the host, and at what cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlow {
    batches_per_step: i64,
    anchors: BTreeMap<TensorId, AnchorReturnType>,
}

impl DataFlow {
    pub fn new(
        batches_per_step: i64,
        anchors: impl IntoIterator<Item = (TensorId, AnchorReturnType)>,
    ) -> Result<Self> {
        if batches_per_step < 1 {
            return Err(error!(
                ErrorKind::InternalLogicError,
                "batches per step must be >= 1, got {batches_per_step}"
            ));
        }
        let mut map = BTreeMap::new();
        for (id, art) in anchors {
            if let AnchorReturnType::EveryN(n) = art {
                if n == 0 {
                    return Err(error!(
                        ErrorKind::InternalLogicError,
                        "anchor {id} returns every 0 batches"
                    ));
                }
            }
            map.insert(id, art);
        }
        Ok(DataFlow {
            batches_per_step,
            anchors: map,
        })
    }

    pub fn batches_per_step(&self) -> i64 {
        self.batches_per_step
    }

    pub fn is_anchored(&self, id: &str) -> bool {
        self.anchors.contains_key(id)
    }

    pub fn anchor_return_type(&self, id: &str) -> Option<AnchorReturnType> {
        self.anchors.get(id).copied()
    }

    /// Anchored tensor ids in deterministic order.
    pub fn anchors(&self) -> Vec<TensorId> {
        self.anchors.keys().cloned().collect()
    }

    pub fn n_anchors(&self) -> usize {
        self.anchors.len()
    }
}

impl Default for DataFlow {
    fn default() -> Self {
        DataFlow {
            batches_per_step: 1,
            anchors: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_policies() {
        assert!(DataFlow::new(0, []).is_err());
        assert!(DataFlow::new(1, [("t".to_string(), AnchorReturnType::EveryN(0))]).is_err());
        let flow = DataFlow::new(
            5,
            [
                ("a".to_string(), AnchorReturnType::All),
                ("b".to_string(), AnchorReturnType::EveryN(2)),
            ],
        )
        .unwrap();
        assert!(flow.is_anchored("a"));
        assert_eq!(flow.anchors(), vec!["a".to_string(), "b".to_string()]);
    }
}
