//! Bounded proof generation.
//!
//! Proving runs on a dedicated worker thread. The caller waits on a channel
//! for at most the configured limit; past it the worker's stop flag is raised
//! and the caller reports a timeout without waiting for the worker to exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use slice_circuit::{gen_proof_cancellable, SliceBundle, SliceCircuitError, SliceProof, SliceTrace};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProverConfig {
    /// Maximum proving time before the slice fails with a timeout. `None` waits indefinitely.
    pub max_proving_time: Option<Duration>,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            max_proving_time: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug)]
pub enum ProveFailure {
    Circuit(SliceCircuitError),
    TimedOut(Duration),
    WorkerLost,
}

pub struct ProofOutcome {
    pub proof: SliceProof,
    pub elapsed: Duration,
}

pub fn prove_bounded(
    bundle: Arc<SliceBundle>,
    trace: SliceTrace,
    config: ProverConfig,
) -> Result<ProofOutcome, ProveFailure> {
    let start = Instant::now();
    let Some(limit) = config.max_proving_time else {
        let proof = gen_proof_cancellable(&bundle, &trace, &AtomicBool::new(false))
            .map_err(ProveFailure::Circuit)?;
        return Ok(ProofOutcome {
            proof,
            elapsed: start.elapsed(),
        });
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let worker_stop = Arc::clone(&stop_flag);
    let slice = bundle.id();
    thread::Builder::new()
        .name(format!("{slice}-prover"))
        .spawn(move || {
            let result = gen_proof_cancellable(&bundle, &trace, &worker_stop);
            let _ = result_tx.send(result);
        })
        .map_err(|_| ProveFailure::WorkerLost)?;

    match result_rx.recv_timeout(limit) {
        Ok(result) => result
            .map(|proof| ProofOutcome {
                proof,
                elapsed: start.elapsed(),
            })
            .map_err(ProveFailure::Circuit),
        Err(RecvTimeoutError::Timeout) => {
            stop_flag.store(true, Ordering::SeqCst);
            warn!(slice = %slice, limit_ms = limit.as_millis() as u64, "proof generation timed out");
            Err(ProveFailure::TimedOut(limit))
        }
        Err(RecvTimeoutError::Disconnected) => Err(ProveFailure::WorkerLost),
    }
}
