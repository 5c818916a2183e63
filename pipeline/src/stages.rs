//! Stage bodies shared by [`crate::orchestrator::ChainRun`] and
//! [`crate::session::SliceHandler`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slice_circuit::{
    generate_witness, verify, ProofFile, SliceBundle, SliceId, SliceProof, SliceTrace, Tensor,
    Witness,
};
use slice_crypto::Digest32;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::fsutil::write_json_atomic;
use crate::input::PROOF_FILE;
use crate::prover::{prove_bounded, ProofOutcome, ProveFailure, ProverConfig};
use crate::results::SliceUpdate;
use crate::run::RunRecord;
use crate::state::Stage;

pub(crate) fn execute(bundle: &SliceBundle, stage: Stage, input: Tensor) -> PipelineResult<Witness> {
    generate_witness(bundle, input).map_err(|err| PipelineError::execution(bundle.id(), stage, err))
}

pub(crate) fn prove(
    bundle: &Arc<SliceBundle>,
    trace: SliceTrace,
    config: ProverConfig,
) -> PipelineResult<ProofOutcome> {
    let slice = bundle.id();
    prove_bounded(Arc::clone(bundle), trace, config).map_err(|failure| match failure {
        ProveFailure::Circuit(err) => PipelineError::proof_generation(slice, err),
        ProveFailure::TimedOut(limit) => PipelineError::Timeout {
            slice,
            stage: Stage::Proof,
            limit,
        },
        ProveFailure::WorkerLost => {
            PipelineError::proof_generation(slice, "prover worker exited without a result")
        }
    })
}

/// Check a proof against the bundle's verifying key.
pub(crate) fn check(bundle: &SliceBundle, proof: &SliceProof) -> PipelineResult<bool> {
    verify(bundle.verifying_key(), &proof.instances, &proof.bytes)
        .map_err(|err| PipelineError::verification(bundle.id(), err))
}

/// `observed` must equal the commitment recorded for `source`.
pub(crate) fn ensure_continuity(
    slice: SliceId,
    stage: Stage,
    source: SliceId,
    recorded: Option<Digest32>,
    observed: Digest32,
) -> PipelineResult<()> {
    match recorded {
        Some(recorded) if recorded == observed => Ok(()),
        Some(recorded) => Err(PipelineError::execution(
            slice,
            stage,
            format!(
                "{source} output commitment {} does not match recorded {}",
                observed.to_hex(),
                recorded.to_hex()
            ),
        )),
        None => Err(PipelineError::execution(
            slice,
            stage,
            format!("{source} has no recorded output commitment"),
        )),
    }
}

pub(crate) fn write_proof(slice_dir: &Path, proof: &SliceProof) -> PipelineResult<ProofFile> {
    let file = proof.to_file();
    write_json_atomic(&slice_dir.join(PROOF_FILE), &file)?;
    Ok(file)
}

/// Record `err` as the failure of `stage` and hand it back.
///
/// A failure that cannot be recorded is logged; the stage error still wins.
pub(crate) fn record_failure(
    run: &mut RunRecord,
    slice: SliceId,
    stage: Stage,
    err: PipelineError,
) -> PipelineError {
    let update = SliceUpdate::failed(stage, err.kind(), err.to_string());
    if let Err(record_err) = run.record(slice, update) {
        warn!(run = %run.id(), slice = %slice, stage = %stage, error = %record_err, "could not record failure");
    }
    warn!(run = %run.id(), slice = %slice, stage = %stage, kind = err.kind(), "stage failed");
    err
}

pub(crate) fn ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
