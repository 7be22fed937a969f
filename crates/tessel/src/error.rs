//! Compiler-wide error type carrying a closed set of failure kinds.

use std::fmt;

use thiserror::Error;

/// Closed set of failure kinds surfaced by the compiler core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    TypeMismatch,
    UnknownOperator,
    UnknownAttribute,
    InvalidPermutation,
    MissingProducer,
    DuplicateProducer,
    DanglingConsumer,
    NonDifferentiable,
    UnreachableLoss,
    IncompleteGrad,
    Cycle,
    ConstraintConflict,
    InsufficientPipelineDepth,
    BatchAxisAmbiguous,
    UnshardableOp,
    InternalLogicError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ShapeMismatch => "shape mismatch",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::UnknownOperator => "unknown operator",
            ErrorKind::UnknownAttribute => "unknown attribute",
            ErrorKind::InvalidPermutation => "invalid permutation",
            ErrorKind::MissingProducer => "missing producer",
            ErrorKind::DuplicateProducer => "duplicate producer",
            ErrorKind::DanglingConsumer => "dangling consumer",
            ErrorKind::NonDifferentiable => "non-differentiable",
            ErrorKind::UnreachableLoss => "unreachable loss",
            ErrorKind::IncompleteGrad => "incomplete gradient",
            ErrorKind::Cycle => "cycle",
            ErrorKind::ConstraintConflict => "constraint conflict",
            ErrorKind::InsufficientPipelineDepth => "insufficient pipeline depth",
            ErrorKind::BatchAxisAmbiguous => "batch axis ambiguous",
            ErrorKind::UnshardableOp => "unshardable op",
            ErrorKind::InternalLogicError => "internal logic error",
        };
        f.write_str(name)
    }
}

/// The single exception type of the compiler: a kind tag plus a message.
///
/// Transforms recover nothing locally; the first detected invariant
/// violation unwinds to the caller as one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Shorthand for invariant violations that indicate a bug in the
    /// compiler itself rather than in user input.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InternalLogicError, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds an [`Error`] with `format!`-style interpolation.
macro_rules! error {
    ($kind:expr, $($arg:tt)*) => {
        $crate::error::Error::new($kind, format!($($arg)*))
    };
}

pub(crate) use error;
