//! Loss declarations and their first-class op forms.

use crate::error::{error, ErrorKind, Result};
use crate::tensor::TensorId;

/// How per-sample losses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Mean,
    None,
}

impl Reduction {
    pub fn name(self) -> &'static str {
        match self {
            Reduction::Sum => "Sum",
            Reduction::Mean => "Mean",
            Reduction::None => "None",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "Sum" => Ok(Reduction::Sum),
            "Mean" => Ok(Reduction::Mean),
            "None" => Ok(Reduction::None),
            other => Err(error!(
                ErrorKind::UnknownAttribute,
                "unknown loss reduction {other}"
            )),
        }
    }
}

/// The loss kinds with first-class gradient ops. Any other loss must be
/// expressed as pre-existing ops whose output tensor is named as the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossKind {
    /// `scale * sum |x|`, with `label` unused.
    L1 { lambda: f32 },
    /// Negative log-likelihood over a probability tensor and integer labels.
    Nll,
    /// Passes the target tensor through, reduced.
    Identity,
}

/// One loss declaration: a target tensor, a combination rule and a scaling
/// factor applied to the gradient seed.
#[derive(Debug, Clone)]
pub struct Loss {
    pub kind: LossKind,
    /// The tensor the loss is computed from.
    pub input: TensorId,
    /// Labels input for NLL losses.
    pub label: Option<TensorId>,
    /// Name of the produced loss tensor.
    pub name: String,
    pub scale: f32,
    pub reduction: Reduction,
}

impl Loss {
    pub fn l1(input: impl Into<TensorId>, name: impl Into<String>, lambda: f32, reduction: Reduction) -> Self {
        Loss {
            kind: LossKind::L1 { lambda },
            input: input.into(),
            label: None,
            name: name.into(),
            scale: 1.0,
            reduction,
        }
    }

    pub fn nll(
        input: impl Into<TensorId>,
        label: impl Into<TensorId>,
        name: impl Into<String>,
        reduction: Reduction,
    ) -> Self {
        Loss {
            kind: LossKind::Nll,
            input: input.into(),
            label: Some(label.into()),
            name: name.into(),
            scale: 1.0,
            reduction,
        }
    }

    pub fn identity(input: impl Into<TensorId>, name: impl Into<String>, reduction: Reduction) -> Self {
        Loss {
            kind: LossKind::Identity,
            input: input.into(),
            label: None,
            name: name.into(),
            scale: 1.0,
            reduction,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }
}
