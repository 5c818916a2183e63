//! Chain orchestration.
//!
//! A [`Pipeline`] owns the loaded bundles of one sliced model. Each
//! [`ChainRun`] it starts owns a fresh run directory and walks slices through
//! input, witness, proof and verification. Slice `i + 1` always takes its
//! input from slice `i`'s `output.json`, and that hand-off is checked against
//! the commitment recorded when slice `i` ran.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use slice_circuit::constants::PROOF_SYSTEM;
use slice_circuit::synthetic::SLICES_DIR;
use slice_circuit::{ProofFile, PublicInstances, SliceBundle, SliceId, SliceProof, VerifyingKey};
use slice_crypto::Digest32;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::input::{read_output, seeded_input, write_input, write_output, InputContext};
use crate::prover::ProverConfig;
use crate::results::{SliceUpdate, StageTimings};
use crate::run::{RunId, RunManager, RunMetadata, RunRecord};
use crate::stages::{check, ensure_continuity, execute, ms, prove, record_failure, write_proof};
use crate::state::{SliceStage, SliceStatus, Stage, Transition};

pub const AGGREGATE_TYPE: &str = "slice-pipeline.aggregate";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Bundle directory under the model root.
    pub slices_dir: String,
    pub prover: ProverConfig,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            slices_dir: SLICES_DIR.to_string(),
            prover: ProverConfig::default(),
        }
    }
}

/// Loaded bundles of one sliced model plus the run root they write under.
#[derive(Debug)]
pub struct Pipeline {
    bundles: Vec<Arc<SliceBundle>>,
    runs: RunManager,
    options: PipelineOptions,
}

impl Pipeline {
    /// Load every `slice_{n}` bundle under `<model_root>/<slices_dir>`.
    pub fn load(
        model_root: &Path,
        run_root: impl Into<PathBuf>,
        options: PipelineOptions,
    ) -> PipelineResult<Self> {
        let slices_root = model_root.join(&options.slices_dir);
        let entries = fs::read_dir(&slices_root).map_err(|err| {
            PipelineError::Configuration(format!(
                "cannot read slice bundles under {}: {err}",
                slices_root.display()
            ))
        })?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::io(&slices_root, err))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<SliceId>().ok())
            {
                dirs.push((id, entry.path()));
            }
        }
        dirs.sort();

        let bundles = dirs
            .into_iter()
            .map(|(_, dir)| {
                SliceBundle::load(&dir).map_err(|err| PipelineError::Configuration(err.to_string()))
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        Self::from_bundles(bundles, run_root, options)
    }

    /// Bundles must be `slice_0..slice_{n-1}` in order, each output shape
    /// feeding the next input shape.
    pub fn from_bundles(
        bundles: Vec<SliceBundle>,
        run_root: impl Into<PathBuf>,
        options: PipelineOptions,
    ) -> PipelineResult<Self> {
        if bundles.is_empty() {
            return Err(PipelineError::Configuration(
                "a pipeline needs at least one slice bundle".into(),
            ));
        }
        for (index, bundle) in bundles.iter().enumerate() {
            if bundle.id().index() as usize != index {
                return Err(PipelineError::Configuration(format!(
                    "slice indices must be contiguous from 0: found {} at position {index}",
                    bundle.id()
                )));
            }
        }
        for pair in bundles.windows(2) {
            let (left, right) = (pair[0].settings(), pair[1].settings());
            if left.output_shape != right.input_shape {
                return Err(PipelineError::Configuration(format!(
                    "{} output shape {:?} does not feed {} input shape {:?}",
                    pair[0].id(),
                    left.output_shape,
                    pair[1].id(),
                    right.input_shape
                )));
            }
        }

        let metadata = RunMetadata {
            proof_system: PROOF_SYSTEM.to_string(),
            slices_dir: format!("{}/", options.slices_dir.trim_end_matches('/')),
        };
        Ok(Self {
            bundles: bundles.into_iter().map(Arc::new).collect(),
            runs: RunManager::with_metadata(run_root, metadata),
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn bundle(&self, index: usize) -> PipelineResult<&Arc<SliceBundle>> {
        self.bundles
            .get(index)
            .ok_or_else(|| PipelineError::NotFound(format!("slice index {index}")))
    }

    pub fn slice_ids(&self) -> Vec<SliceId> {
        self.bundles.iter().map(|bundle| bundle.id()).collect()
    }

    pub fn verifying_keys(&self) -> Vec<VerifyingKey> {
        self.bundles
            .iter()
            .map(|bundle| bundle.verifying_key().clone())
            .collect()
    }

    pub fn run_manager(&self) -> &RunManager {
        &self.runs
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Allocate a new run directory and return the handle that drives it.
    pub fn start_run(&self) -> PipelineResult<ChainRun<'_>> {
        let record = self.runs.create_run()?;
        info!(run = %record.id(), slices = self.len(), "started chain run");
        Ok(ChainRun {
            pipeline: self,
            record,
            stages: vec![SliceStage::Created; self.len()],
        })
    }
}

/// Outcome of [`ChainRun::run_all`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainOutcome {
    pub run_id: RunId,
    pub verified: Vec<SliceId>,
    /// Slice whose proof verified `false`, stopping the chain.
    pub rejected: Option<SliceId>,
    pub complete: bool,
}

/// One run of the chain. Owns its [`RunRecord`] and so the run's lock.
#[derive(Debug)]
pub struct ChainRun<'p> {
    pipeline: &'p Pipeline,
    record: RunRecord,
    stages: Vec<SliceStage>,
}

impl<'p> ChainRun<'p> {
    pub fn run_id(&self) -> RunId {
        *self.record.id()
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn into_record(self) -> RunRecord {
        self.record
    }

    pub fn status(&self, index: usize) -> Option<SliceStatus> {
        self.stages.get(index).map(SliceStage::status)
    }

    /// Write `input.json` for slice `index`.
    ///
    /// Slice 0 takes a sample or a seed; every later slice takes the previous
    /// slice's verified output. Returns the input commitment.
    pub fn generate_input(
        &mut self,
        index: usize,
        context: InputContext,
    ) -> PipelineResult<Digest32> {
        let slice = self.ensure(index, Stage::Input)?;
        match (index, &context) {
            (0, InputContext::PreviousOutput) => {
                return Err(PipelineError::Configuration(format!(
                    "{slice} has no previous slice to take input from"
                )))
            }
            (0, _) => {}
            (_, InputContext::PreviousOutput) => self.ensure_previous_verified(index)?,
            _ => {
                return Err(PipelineError::Configuration(format!(
                    "{slice} takes its input from the previous slice's output"
                )))
            }
        }
        let bundle = Arc::clone(self.pipeline.bundle(index)?);
        self.input_stage(index, slice, &bundle, context)
            .map_err(|err| self.fail(index, Stage::Input, err))
    }

    /// Execute slice `index` on its held input and write `output.json`.
    /// Returns the output commitment.
    pub fn generate_witness(&mut self, index: usize) -> PipelineResult<Digest32> {
        let slice = self.ensure(index, Stage::Witness)?;
        let bundle = Arc::clone(self.pipeline.bundle(index)?);
        self.witness_stage(index, slice, &bundle)
            .map_err(|err| self.fail(index, Stage::Witness, err))
    }

    /// Prove slice `index` and write `proof.json`.
    pub fn gen_proof(&mut self, index: usize) -> PipelineResult<PublicInstances> {
        let slice = self.ensure(index, Stage::Proof)?;
        let bundle = Arc::clone(self.pipeline.bundle(index)?);
        self.proof_stage(index, slice, &bundle)
            .map_err(|err| self.fail(index, Stage::Proof, err))
    }

    /// Verify slice `index`'s proof. A proof that does not check out marks
    /// the slice failed with kind `rejected` and returns `Ok(false)`.
    pub fn verify(&mut self, index: usize) -> PipelineResult<bool> {
        let slice = self.ensure(index, Stage::Verify)?;
        let bundle = Arc::clone(self.pipeline.bundle(index)?);
        match self.verify_stage(index, slice, &bundle) {
            Ok(true) => Ok(true),
            Ok(false) => {
                let message = "proof did not verify against the slice verifying key";
                if let Err(err) = self
                    .record
                    .record(slice, SliceUpdate::failed(Stage::Verify, "rejected", message))
                {
                    return Err(self.fail(index, Stage::Verify, err));
                }
                let current = mem::replace(&mut self.stages[index], SliceStage::Created);
                self.stages[index] = match current.failed(Stage::Verify, "rejected", message) {
                    Ok(failed) => failed,
                    Err(refused) => refused.stage,
                };
                warn!(run = %self.record.id(), slice = %slice, "proof rejected");
                Ok(false)
            }
            Err(err) => Err(self.fail(index, Stage::Verify, err)),
        }
    }

    pub fn run_slice(&mut self, index: usize, context: InputContext) -> PipelineResult<bool> {
        self.generate_input(index, context)?;
        self.generate_witness(index)?;
        self.gen_proof(index)?;
        self.verify(index)
    }

    /// Drive every slice in order. `context` feeds slice 0; slices already
    /// verified in this run are skipped. Stops at the first rejected proof.
    pub fn run_all(&mut self, context: InputContext) -> PipelineResult<ChainOutcome> {
        let mut context = context;
        for index in 0..self.stages.len() {
            let next = mem::replace(&mut context, InputContext::PreviousOutput);
            if self.stages[index].status() == SliceStatus::Verified {
                continue;
            }
            if !self.run_slice(index, next)? {
                let rejected = self.pipeline.bundle(index)?.id();
                return Ok(self.outcome(Some(rejected)));
            }
        }
        let outcome = self.outcome(None);
        info!(run = %outcome.run_id, complete = outcome.complete, "chain run finished");
        Ok(outcome)
    }

    /// Reopen a failed slice as a fresh attempt.
    pub fn retry_slice(&mut self, index: usize) -> PipelineResult<()> {
        let slice = self.ensure(index, Stage::Retry)?;
        self.record
            .record(slice, SliceUpdate::status(SliceStatus::Created))?;
        self.advance(index, Stage::Retry, SliceStage::retried)?;
        info!(run = %self.record.id(), slice = %slice, "slice reopened for retry");
        Ok(())
    }

    /// Proofs held by this run, in slice order.
    pub fn proofs(&self) -> Vec<(SliceId, SliceProof)> {
        self.pipeline
            .bundles
            .iter()
            .zip(&self.stages)
            .filter_map(|(bundle, stage)| stage.proof().map(|proof| (bundle.id(), proof.clone())))
            .collect()
    }

    pub fn aggregate(&self) -> AggregateManifest {
        let parts: Vec<(SliceId, ProofFile)> = self
            .proofs()
            .into_iter()
            .map(|(slice, proof)| (slice, proof.to_file()))
            .collect();
        aggregate_proofs(&parts)
    }

    fn input_stage(
        &mut self,
        index: usize,
        slice: SliceId,
        bundle: &SliceBundle,
        context: InputContext,
    ) -> PipelineResult<Digest32> {
        let input = match context {
            InputContext::Sample(tensor) => tensor,
            InputContext::Seed(seed) => seeded_input(bundle.settings(), &seed)?,
            InputContext::PreviousOutput => self.previous_output(index, Stage::Input)?,
        };
        let commitment = input.commitment();
        write_input(&self.record.slice_dir(slice), &input)?;
        self.record.record(
            slice,
            SliceUpdate::status(SliceStatus::InputGenerated).with_input_commitment(commitment),
        )?;
        self.advance(index, Stage::Input, |stage| stage.with_input(input))?;
        info!(run = %self.record.id(), slice = %slice, stage = %Stage::Input, "input generated");
        Ok(commitment)
    }

    fn witness_stage(
        &mut self,
        index: usize,
        slice: SliceId,
        bundle: &SliceBundle,
    ) -> PipelineResult<Digest32> {
        let input = self.stages[index]
            .input()
            .cloned()
            .ok_or_else(|| PipelineError::execution(slice, Stage::Witness, "no input held"))?;
        let started = Instant::now();
        let witness = execute(bundle, Stage::Witness, input)?;
        let elapsed = started.elapsed();

        write_output(&self.record.slice_dir(slice), &witness.output)?;
        let output_commitment = witness.output_commitment;
        self.record.record(
            slice,
            SliceUpdate::status(SliceStatus::WitnessGenerated)
                .with_input_commitment(witness.input_commitment)
                .with_output_commitment(output_commitment)
                .with_timings(StageTimings {
                    witness: Some(ms(elapsed)),
                    ..StageTimings::default()
                }),
        )?;
        self.advance(index, Stage::Witness, |stage| stage.with_witness(witness))?;
        info!(
            run = %self.record.id(),
            slice = %slice,
            stage = %Stage::Witness,
            elapsed_ms = ms(elapsed),
            "witness generated"
        );
        Ok(output_commitment)
    }

    fn proof_stage(
        &mut self,
        index: usize,
        slice: SliceId,
        bundle: &Arc<SliceBundle>,
    ) -> PipelineResult<PublicInstances> {
        let witness = self.stages[index]
            .witness()
            .cloned()
            .ok_or_else(|| PipelineError::execution(slice, Stage::Proof, "no witness held"))?;
        if index > 0 {
            self.previous_output(index, Stage::Proof)?;
            let source = self.pipeline.bundle(index - 1)?.id();
            let recorded = self
                .record
                .results()
                .latest(source)
                .and_then(|attempt| attempt.output_commitment);
            ensure_continuity(slice, Stage::Proof, source, recorded, witness.input_commitment)?;
        }

        let outcome = prove(bundle, witness.trace, self.pipeline.options.prover)?;
        let instances = outcome.proof.instances;
        write_proof(&self.record.slice_dir(slice), &outcome.proof)?;
        self.record.record(
            slice,
            SliceUpdate::status(SliceStatus::ProofGenerated).with_timings(StageTimings {
                proof: Some(ms(outcome.elapsed)),
                ..StageTimings::default()
            }),
        )?;
        let proof = outcome.proof;
        self.advance(index, Stage::Proof, |stage| stage.with_proof(proof))?;
        info!(
            run = %self.record.id(),
            slice = %slice,
            stage = %Stage::Proof,
            elapsed_ms = ms(outcome.elapsed),
            "proof generated"
        );
        Ok(instances)
    }

    fn verify_stage(
        &mut self,
        index: usize,
        slice: SliceId,
        bundle: &SliceBundle,
    ) -> PipelineResult<bool> {
        let proof = self.stages[index]
            .proof()
            .cloned()
            .ok_or_else(|| PipelineError::verification(slice, "no proof held"))?;
        let started = Instant::now();
        if !check(bundle, &proof)? {
            return Ok(false);
        }
        let elapsed = started.elapsed();
        self.record.record(
            slice,
            SliceUpdate::status(SliceStatus::Verified).with_timings(StageTimings {
                verify: Some(ms(elapsed)),
                ..StageTimings::default()
            }),
        )?;
        self.advance(index, Stage::Verify, SliceStage::verified)?;
        info!(
            run = %self.record.id(),
            slice = %slice,
            stage = %Stage::Verify,
            elapsed_ms = ms(elapsed),
            "proof verified"
        );
        Ok(true)
    }

    /// Read the previous slice's `output.json` and check it against the
    /// commitment recorded when that slice ran.
    fn previous_output(&self, index: usize, stage: Stage) -> PipelineResult<slice_circuit::Tensor> {
        let slice = self.pipeline.bundle(index)?.id();
        let source = self.pipeline.bundle(index - 1)?.id();
        let output = read_output(&self.record.slice_dir(source)).map_err(|err| {
            PipelineError::execution(slice, stage, format!("{source} output unreadable: {err}"))
        })?;
        let recorded = self
            .record
            .results()
            .latest(source)
            .and_then(|attempt| attempt.output_commitment);
        ensure_continuity(slice, stage, source, recorded, output.commitment())?;
        Ok(output)
    }

    fn ensure_previous_verified(&self, index: usize) -> PipelineResult<()> {
        let source = self.pipeline.bundle(index - 1)?.id();
        let actual = self.stages[index - 1].status();
        if actual != SliceStatus::Verified {
            return Err(PipelineError::OutOfOrder {
                slice: source,
                stage: Stage::Input,
                expected: SliceStatus::Verified,
                actual,
            });
        }
        Ok(())
    }

    fn ensure(&self, index: usize, stage: Stage) -> PipelineResult<SliceId> {
        let slice = self.pipeline.bundle(index)?.id();
        let actual = self.stages[index].status();
        let expected = stage.requires();
        if actual != expected {
            return Err(PipelineError::OutOfOrder {
                slice,
                stage,
                expected,
                actual,
            });
        }
        Ok(slice)
    }

    fn advance(
        &mut self,
        index: usize,
        stage: Stage,
        step: impl FnOnce(SliceStage) -> Transition,
    ) -> PipelineResult<()> {
        let current = mem::replace(&mut self.stages[index], SliceStage::Created);
        match step(current) {
            Ok(next) => {
                self.stages[index] = next;
                Ok(())
            }
            Err(refused) => {
                let actual = refused.from();
                self.stages[index] = refused.stage;
                Err(PipelineError::OutOfOrder {
                    slice: self.pipeline.bundle(index)?.id(),
                    stage,
                    expected: stage.requires(),
                    actual,
                })
            }
        }
    }

    fn fail(&mut self, index: usize, stage: Stage, err: PipelineError) -> PipelineError {
        let slice = match self.pipeline.bundle(index) {
            Ok(bundle) => bundle.id(),
            Err(_) => return err,
        };
        let err = record_failure(&mut self.record, slice, stage, err);
        let current = mem::replace(&mut self.stages[index], SliceStage::Created);
        self.stages[index] = match current.failed(stage, err.kind(), err.to_string()) {
            Ok(failed) => failed,
            Err(refused) => refused.stage,
        };
        err
    }

    fn outcome(&self, rejected: Option<SliceId>) -> ChainOutcome {
        let verified = self
            .pipeline
            .bundles
            .iter()
            .zip(&self.stages)
            .filter(|(_, stage)| stage.status() == SliceStatus::Verified)
            .map(|(bundle, _)| bundle.id())
            .collect();
        ChainOutcome {
            run_id: *self.record.id(),
            verified,
            rejected,
            complete: self
                .pipeline
                .runs
                .check_run_completion(&self.record, &self.pipeline.slice_ids()),
        }
    }
}

/// Per-slice verdicts plus linkage between adjacent slices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainVerdict {
    pub slices: Vec<bool>,
    /// `links[i]`: slice `i`'s output commitment is slice `i + 1`'s input commitment.
    pub links: Vec<bool>,
}

impl ChainVerdict {
    pub fn accepted(&self) -> bool {
        !self.slices.is_empty()
            && self.slices.iter().all(|ok| *ok)
            && self.links.iter().all(|ok| *ok)
    }
}

/// Verify a chain of proofs from the verifying keys and the proofs alone.
pub fn verify_chain(
    verifying_keys: &[VerifyingKey],
    proofs: &[SliceProof],
) -> PipelineResult<ChainVerdict> {
    if verifying_keys.len() != proofs.len() {
        return Err(PipelineError::Configuration(format!(
            "{} verifying keys for {} proofs",
            verifying_keys.len(),
            proofs.len()
        )));
    }
    let mut slices = Vec::with_capacity(proofs.len());
    for (index, (key, proof)) in verifying_keys.iter().zip(proofs).enumerate() {
        let slice = SliceId(u32::try_from(index).unwrap_or(u32::MAX));
        let ok = slice_circuit::verify(key, &proof.instances, &proof.bytes)
            .map_err(|err| PipelineError::verification(slice, err))?;
        slices.push(ok);
    }
    let links = proofs
        .windows(2)
        .map(|pair| pair[0].instances.output_commitment == pair[1].instances.input_commitment)
        .collect();
    Ok(ChainVerdict { slices, links })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatePart {
    pub slice_id: SliceId,
    pub proof: String,
    pub instances: Vec<String>,
}

/// Non-cryptographic bundle of per-slice proofs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateManifest {
    #[serde(rename = "type")]
    pub kind: String,
    pub parts: Vec<AggregatePart>,
}

pub fn aggregate_proofs(parts: &[(SliceId, ProofFile)]) -> AggregateManifest {
    AggregateManifest {
        kind: AGGREGATE_TYPE.to_string(),
        parts: parts
            .iter()
            .map(|(slice, file)| AggregatePart {
                slice_id: *slice,
                proof: file.proof.clone(),
                instances: file.instances.clone(),
            })
            .collect(),
    }
}
