use std::path::{Path, PathBuf};
use std::time::Duration;

use slice_circuit::SliceId;
use thiserror::Error;

use crate::state::{SliceStatus, Stage};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("run directory collision under {root}: {reason}")]
    DirectoryCollision { root: PathBuf, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{slice} {stage}: execution error: {message}")]
    Execution {
        slice: SliceId,
        stage: Stage,
        message: String,
    },

    #[error("{slice} {stage}: proof generation error: {message}")]
    ProofGeneration {
        slice: SliceId,
        stage: Stage,
        message: String,
    },

    #[error("{slice} {stage}: verification error: {message}")]
    Verification {
        slice: SliceId,
        stage: Stage,
        message: String,
    },

    #[error("{slice}: {stage} requires status {expected}, slice is {actual}")]
    OutOfOrder {
        slice: SliceId,
        stage: Stage,
        expected: SliceStatus,
        actual: SliceStatus,
    },

    #[error("{slice} {stage}: timed out after {limit:?}")]
    Timeout {
        slice: SliceId,
        stage: Stage,
        limit: Duration,
    },

    #[error("run {run} is locked by another writer")]
    RunLocked { run: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn execution(slice: SliceId, stage: Stage, message: impl ToString) -> Self {
        Self::Execution {
            slice,
            stage,
            message: message.to_string(),
        }
    }

    pub(crate) fn proof_generation(slice: SliceId, message: impl ToString) -> Self {
        Self::ProofGeneration {
            slice,
            stage: Stage::Proof,
            message: message.to_string(),
        }
    }

    pub(crate) fn verification(slice: SliceId, message: impl ToString) -> Self {
        Self::Verification {
            slice,
            stage: Stage::Verify,
            message: message.to_string(),
        }
    }

    /// Stable name recorded as the failure kind in `run_results.json`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::DirectoryCollision { .. } => "directory_collision",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Execution { .. } => "execution",
            PipelineError::ProofGeneration { .. } => "proof_generation",
            PipelineError::Verification { .. } => "verification",
            PipelineError::OutOfOrder { .. } => "out_of_order",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::RunLocked { .. } => "run_locked",
            PipelineError::Io { .. } => "io",
            PipelineError::Json { .. } => "json",
        }
    }

    pub fn slice(&self) -> Option<SliceId> {
        match self {
            PipelineError::Execution { slice, .. }
            | PipelineError::ProofGeneration { slice, .. }
            | PipelineError::Verification { slice, .. }
            | PipelineError::OutOfOrder { slice, .. }
            | PipelineError::Timeout { slice, .. } => Some(*slice),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Execution { stage, .. }
            | PipelineError::ProofGeneration { stage, .. }
            | PipelineError::Verification { stage, .. }
            | PipelineError::OutOfOrder { stage, .. }
            | PipelineError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
