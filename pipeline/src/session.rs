//! Single-slice entry points.
//!
//! A [`SliceHandler`] drives one slice bundle against a run root, one stage
//! per call, with the run directory as the only state between calls. A
//! [`Session`] without a run attaches to the latest run under the root.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use slice_circuit::{bind_input, ProofFile, SliceBundle, SliceId, SliceProof, Tensor};
use tracing::{info, warn};

use crate::config::HandlerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::input::{read_input, read_output, write_input, write_output, INPUT_FILE, PROOF_FILE};
use crate::prover::ProverConfig;
use crate::results::{RunResults, SliceUpdate, StageTimings};
use crate::run::{RunId, RunManager, RunRecord};
use crate::stages::{check, ensure_continuity, execute, ms, prove, record_failure, write_proof};
use crate::state::{SliceStatus, Stage};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub run_id: Option<RunId>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id: Some(run_id),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SliceHandler {
    bundle: Arc<SliceBundle>,
    runs: RunManager,
    prover: ProverConfig,
}

impl SliceHandler {
    pub fn new(config: &HandlerConfig) -> PipelineResult<Self> {
        let bundle = SliceBundle::load(config.slice_path())
            .map_err(|err| PipelineError::Configuration(err.to_string()))?;
        Ok(Self::from_bundle(
            Arc::new(bundle),
            config.run_root(),
            config.prover(),
        ))
    }

    pub(crate) fn from_bundle(
        bundle: Arc<SliceBundle>,
        run_root: impl Into<PathBuf>,
        prover: ProverConfig,
    ) -> Self {
        Self {
            bundle,
            runs: RunManager::new(run_root),
            prover,
        }
    }

    pub fn bundle(&self) -> &SliceBundle {
        &self.bundle
    }

    pub fn slice(&self) -> SliceId {
        self.bundle.id()
    }

    pub fn run_manager(&self) -> &RunManager {
        &self.runs
    }

    /// Write `input.json`, creating a run if the session has none.
    pub fn gen_input_file(&self, session: &mut Session, input: &Tensor) -> PipelineResult<PathBuf> {
        let mut run = match session.run_id {
            Some(id) => self.runs.open_run(&id)?,
            None => {
                let run = self.runs.create_run()?;
                session.run_id = Some(*run.id());
                run
            }
        };
        let slice = self.slice();
        self.ensure(&run, Stage::Input)?;
        let dir = run.slice_dir(slice);
        let written = write_input(&dir, input).and_then(|()| {
            run.record(
                slice,
                SliceUpdate::status(SliceStatus::InputGenerated)
                    .with_input_commitment(input.commitment()),
            )
        });
        if let Err(err) = written {
            return Err(record_failure(&mut run, slice, Stage::Input, err));
        }
        info!(run = %run.id(), slice = %slice, stage = %Stage::Input, "input file written");
        Ok(dir.join(INPUT_FILE))
    }

    /// Execute the slice on `input.json`, write `output.json` and return the
    /// updated run results.
    pub fn generate_witness(&self, session: &mut Session) -> PipelineResult<RunResults> {
        let mut run = self.attach(session)?;
        let slice = self.slice();
        self.ensure(&run, Stage::Witness)?;
        if let Err(err) = self.witness_stage(&mut run) {
            return Err(record_failure(&mut run, slice, Stage::Witness, err));
        }
        Ok(run.results().clone())
    }

    /// Prove the slice from `input.json` and return `(proof_json, instances_json)`.
    ///
    /// The slice is re-executed first; its output commitment must match both
    /// the one recorded at witness time and `output.json` on disk.
    pub fn gen_proof(&self, session: &mut Session) -> PipelineResult<(String, String)> {
        let mut run = self.attach(session)?;
        let slice = self.slice();
        self.ensure(&run, Stage::Proof)?;
        let file = match self.proof_stage(&mut run) {
            Ok(file) => file,
            Err(err) => return Err(record_failure(&mut run, slice, Stage::Proof, err)),
        };
        let path = run.slice_dir(slice).join(PROOF_FILE);
        let proof_json =
            serde_json::to_string(&file).map_err(|err| PipelineError::json(&path, err))?;
        let instances_json =
            serde_json::to_string(&file.instances).map_err(|err| PipelineError::json(&path, err))?;
        Ok((proof_json, instances_json))
    }

    /// Verify `proof` with the slice's verifying key.
    ///
    /// `inputs`, when given, replaces the input instance with its own
    /// commitment. The outcome is recorded only if the attached run has this
    /// slice waiting for verification.
    pub fn verify_proof(
        &self,
        session: &mut Session,
        inputs: Option<Tensor>,
        proof: &ProofFile,
    ) -> PipelineResult<bool> {
        let mut run = match self.attach(session) {
            Ok(run) => Some(run),
            Err(PipelineError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };
        let slice = self.slice();
        let recording = run.as_ref().and_then(|run| run.results().latest_status(slice))
            == Some(SliceStatus::ProofGenerated);

        let started = Instant::now();
        let verdict = self.check_file(inputs, proof);
        let elapsed = started.elapsed();
        let Some(run) = run.as_mut().filter(|_| recording) else {
            return verdict;
        };
        match verdict {
            Ok(true) => {
                run.record(
                    slice,
                    SliceUpdate::status(SliceStatus::Verified).with_timings(StageTimings {
                        verify: Some(ms(elapsed)),
                        ..StageTimings::default()
                    }),
                )?;
                info!(run = %run.id(), slice = %slice, elapsed_ms = ms(elapsed), "proof verified");
                Ok(true)
            }
            Ok(false) => {
                run.record(
                    slice,
                    SliceUpdate::failed(
                        Stage::Verify,
                        "rejected",
                        "proof did not verify against the slice verifying key",
                    ),
                )?;
                warn!(run = %run.id(), slice = %slice, "proof rejected");
                Ok(false)
            }
            Err(err) => Err(record_failure(run, slice, Stage::Verify, err)),
        }
    }

    fn witness_stage(&self, run: &mut RunRecord) -> PipelineResult<()> {
        let slice = self.slice();
        let dir = run.slice_dir(slice);
        let input = read_input(&dir)?;
        let started = Instant::now();
        let witness = execute(&self.bundle, Stage::Witness, input)?;
        let elapsed = started.elapsed();
        write_output(&dir, &witness.output)?;
        run.record(
            slice,
            SliceUpdate::status(SliceStatus::WitnessGenerated)
                .with_input_commitment(witness.input_commitment)
                .with_output_commitment(witness.output_commitment)
                .with_timings(StageTimings {
                    witness: Some(ms(elapsed)),
                    ..StageTimings::default()
                }),
        )?;
        info!(
            run = %run.id(),
            slice = %slice,
            stage = %Stage::Witness,
            elapsed_ms = ms(elapsed),
            "witness generated"
        );
        Ok(())
    }

    fn proof_stage(&self, run: &mut RunRecord) -> PipelineResult<ProofFile> {
        let slice = self.slice();
        let dir = run.slice_dir(slice);
        let input = read_input(&dir)?;
        let witness = execute(&self.bundle, Stage::Proof, input)?;

        let recorded = run
            .results()
            .latest(slice)
            .and_then(|attempt| attempt.output_commitment);
        ensure_continuity(slice, Stage::Proof, slice, recorded, witness.output_commitment)?;
        let on_disk = read_output(&dir).map_err(|err| {
            PipelineError::execution(slice, Stage::Proof, format!("output unreadable: {err}"))
        })?;
        if on_disk.commitment() != witness.output_commitment {
            return Err(PipelineError::execution(
                slice,
                Stage::Proof,
                "output.json does not match the re-executed output",
            ));
        }

        let outcome = prove(&self.bundle, witness.trace, self.prover)?;
        let file = write_proof(&dir, &outcome.proof)?;
        run.record(
            slice,
            SliceUpdate::status(SliceStatus::ProofGenerated).with_timings(StageTimings {
                proof: Some(ms(outcome.elapsed)),
                ..StageTimings::default()
            }),
        )?;
        info!(
            run = %run.id(),
            slice = %slice,
            stage = %Stage::Proof,
            elapsed_ms = ms(outcome.elapsed),
            "proof generated"
        );
        Ok(file)
    }

    fn check_file(&self, inputs: Option<Tensor>, file: &ProofFile) -> PipelineResult<bool> {
        let slice = self.slice();
        let mut proof =
            SliceProof::from_file(file).map_err(|err| PipelineError::verification(slice, err))?;
        if let Some(input) = inputs {
            proof.instances = bind_input(proof.instances, self.bundle.settings(), input)
                .map_err(|err| PipelineError::verification(slice, err))?;
        }
        check(&self.bundle, &proof)
    }

    fn attach(&self, session: &mut Session) -> PipelineResult<RunRecord> {
        match session.run_id {
            Some(id) => self.runs.open_run(&id),
            None => {
                let run = self.runs.get_latest_run()?;
                session.run_id = Some(*run.id());
                Ok(run)
            }
        }
    }

    /// A stage may run only from the status it requires. Input may also open
    /// a new attempt after a failure.
    fn ensure(&self, run: &RunRecord, stage: Stage) -> PipelineResult<()> {
        let slice = self.slice();
        let actual = run
            .results()
            .latest_status(slice)
            .unwrap_or(SliceStatus::Created);
        let expected = stage.requires();
        if actual == expected || (stage == Stage::Input && actual == SliceStatus::Failed) {
            return Ok(());
        }
        Err(PipelineError::OutOfOrder {
            slice,
            stage,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slice_circuit::synthetic::SyntheticModel;

    fn handler(run_root: &std::path::Path) -> SliceHandler {
        let bundle = SyntheticModel {
            slices: 1,
            hidden: 4,
            width: 3,
            ..SyntheticModel::default()
        }
        .bundles()
        .expect("bundles")
        .remove(0);
        SliceHandler::from_bundle(Arc::new(bundle), run_root, ProverConfig::default())
    }

    #[test]
    fn witness_without_a_run_is_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let handler = handler(root.path());
        let err = handler
            .generate_witness(&mut Session::new())
            .expect_err("no run");
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn proving_twice_is_out_of_order() {
        let root = tempfile::tempdir().expect("tempdir");
        let handler = handler(root.path());
        let mut session = Session::new();
        let input = Tensor::new(vec![1, 3], vec![0.25, 0.5, 0.75]).expect("tensor");
        handler.gen_input_file(&mut session, &input).expect("input");
        handler.generate_witness(&mut session).expect("witness");
        handler.gen_proof(&mut session).expect("proof");
        let err = handler.gen_proof(&mut session).expect_err("second proof");
        assert!(matches!(
            err,
            PipelineError::OutOfOrder {
                stage: Stage::Proof,
                actual: SliceStatus::ProofGenerated,
                ..
            }
        ));
    }
}
