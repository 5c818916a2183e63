use std::path::PathBuf;

use slice_crypto::Digest32;
use thiserror::Error;

use crate::settings::InputType;

#[derive(Debug, Error)]
pub enum SliceCircuitError {
    #[error("input shape {actual:?} does not match circuit input shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("input value {value} at index {index} is not a valid {input_type:?} input")]
    InputType {
        index: usize,
        value: f64,
        input_type: InputType,
    },

    #[error("value at index {index} overflows the fixed-point range at scale {scale}")]
    QuantizationOverflow { index: usize, scale: u32 },

    #[error("arithmetic overflow in layer {layer}")]
    ArithmeticOverflow { layer: usize },

    #[error("malformed tensor: {0}")]
    MalformedTensor(String),

    #[error("invalid circuit settings: {0}")]
    InvalidSettings(String),

    #[error("invalid compiled circuit: {0}")]
    InvalidCircuit(String),

    #[error("invalid slice bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    #[error("malformed trace: {0}")]
    MalformedTrace(String),

    #[error("proving key is bound to circuit {key}, trace was produced by circuit {circuit}")]
    KeyMismatch { key: Digest32, circuit: Digest32 },

    #[error("proof generation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SliceCircuitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<bincode::Error> for SliceCircuitError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SliceCircuitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Structural verification failures.
///
/// A well-formed proof that does not check out is not an error: the verifier
/// returns `Ok(false)` for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SliceVerifyError {
    #[error("invalid proof format: {0}")]
    InvalidProofFormat(String),

    #[error("invalid public instances: {0}")]
    InvalidPublicInstances(String),
}
