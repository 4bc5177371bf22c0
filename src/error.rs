// src/error.rs
use crate::backend::Backend;
use crate::graph::TensorId;
use crate::shape::Shape;
use thiserror::Error;

/// Errors raised by graph construction, the backward pass and the device layer.
///
/// All of them are reported at the point of the offending call. A failed
/// operation never enters the graph and never modifies its inputs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutogradError {
    #[error("shape mismatch in {op}: expected {expected}, found {found}")]
    ShapeMismatch {
        op: &'static str,
        expected: Shape,
        found: Shape,
    },

    #[error("backend mismatch: expected {expected}, found {found}")]
    BackendMismatch { expected: Backend, found: Backend },

    #[error("{0} backend is not available")]
    BackendUnavailable(Backend),

    #[error("transfer to {target} failed: {reason}")]
    TransferFailure { target: Backend, reason: String },

    #[error("cannot run backward from {id}: {reason}")]
    InvalidRoot { id: TensorId, reason: String },

    #[error("{0} does not belong to this graph")]
    UnknownTensor(TensorId),

    #[error("{0} is produced by an operation, only leaf values can be written")]
    NotALeaf(TensorId),

    #[error("accelerator error: {0}")]
    Accelerator(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AutogradError>;
