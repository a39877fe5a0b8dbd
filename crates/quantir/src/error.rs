use thiserror::Error;

/// Terminal failure produced by any compilation stage.
///
/// Every variant names the offending node or edge so callers can report a
/// single actionable diagnostic. Convergence exhaustion is deliberately not
/// here: the pass pipeline reports it as a non-fatal flag on its outcome.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("invalid graph at '{node}': {reason}")]
    InvalidGraph { node: String, reason: String },

    #[error("graph contains a cycle")]
    CycleDetected,

    #[error("no known conversion from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },

    #[error("operation '{op}' is not supported by the target")]
    UnsupportedOperation { op: String },

    #[error("shape mismatch at '{node}': {detail}")]
    ShapeMismatch { node: String, detail: String },

    #[error("'{node}' requires static dimensions")]
    StaticShapeRequired { node: String },

    #[error("input {input} of '{node}' resolves to a primitive that was not emitted yet")]
    UnresolvedDependency { node: String, input: usize },
}

impl CompileError {
    pub(crate) fn invalid_graph(node: impl ToString, reason: impl ToString) -> Self {
        CompileError::InvalidGraph {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn shape_mismatch(node: impl ToString, detail: impl ToString) -> Self {
        CompileError::ShapeMismatch {
            node: node.to_string(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn unsupported_conversion(
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        CompileError::UnsupportedConversion {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
