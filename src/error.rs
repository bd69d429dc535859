//! Error types for the quantization pipeline

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, QuantError>;

/// Errors that can occur while quantizing a graph
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("unsupported graph construct in {pass} pass at node '{node}'")]
    UnsupportedGraphConstruct { pass: &'static str, node: String },

    #[error("no calibration data observed for '{node}'; run the instrumented module at least once before convert")]
    InsufficientCalibrationData { node: String },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("missing constant: {0}")]
    MissingConstant(String),

    #[error("missing required attribute: {0}")]
    MissingAttribute(String),

    #[error("invalid attribute value: {0}")]
    InvalidAttribute(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("graph error: {0}")]
    Graph(String),
}

// The graph IR's internal helpers report through anyhow; convert at the
// pass boundary.
impl From<anyhow::Error> for QuantError {
    fn from(err: anyhow::Error) -> Self {
        QuantError::Graph(err.to_string())
    }
}
