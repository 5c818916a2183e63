//! Slice-by-slice inference proof pipeline.
//!
//! Runs a sliced model through input generation, witness generation, proving
//! and verification, one slice at a time, persisting every artifact and stage
//! outcome under a timestamped run directory.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod input;
pub mod orchestrator;
pub mod prover;
pub mod results;
pub mod run;
pub mod session;
mod stages;
pub mod state;

pub use config::{ChainConfig, HandlerConfig, PipelineConfig};
pub use error::{PipelineError, PipelineResult};
pub use input::InputContext;
pub use orchestrator::{
    aggregate_proofs, verify_chain, AggregateManifest, ChainOutcome, ChainRun, ChainVerdict,
    Pipeline, PipelineOptions,
};
pub use prover::ProverConfig;
pub use results::{RunResults, SliceAttempt, SliceUpdate};
pub use run::{RunId, RunManager, RunMetadata, RunRecord};
pub use session::{Session, SliceHandler};
pub use state::{SliceStage, SliceStatus, Stage};
