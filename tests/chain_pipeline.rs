//! End-to-end chain runs over synthetic sliced models.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use slice_circuit::synthetic::SyntheticModel;
use slice_circuit::{SliceId, SliceProof, Tensor};
use slice_pipeline::input::{OutputFile, INPUT_FILE, OUTPUT_FILE, PROOF_FILE};
use slice_pipeline::run::{METADATA_FILE, RUN_RESULTS_FILE};
use slice_pipeline::{
    verify_chain, InputContext, Pipeline, PipelineError, PipelineOptions, ProverConfig,
    RunMetadata, RunResults, SliceStatus, Stage,
};

fn write_model(root: &Path, model: SyntheticModel) {
    model.write(root).expect("write synthetic model");
}

fn load(root: &Path, options: PipelineOptions) -> Pipeline {
    Pipeline::load(root, root.join("run"), options).expect("load pipeline")
}

fn small_model(slices: u32) -> SyntheticModel {
    SyntheticModel {
        slices,
        width: 4,
        hidden: 6,
        ..SyntheticModel::default()
    }
}

#[test]
fn five_slice_chain_verifies_and_links() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), SyntheticModel::default());
    let pipeline = load(root.path(), PipelineOptions::default());
    assert_eq!(pipeline.len(), 5);

    let mut run = pipeline.start_run().expect("start run");
    let outcome = run
        .run_all(InputContext::Seed(b"five-slices".to_vec()))
        .expect("chain run");
    assert!(outcome.complete);
    assert_eq!(outcome.rejected, None);
    assert_eq!(outcome.verified, pipeline.slice_ids());

    let run_dir = run.record().dir().to_path_buf();
    for slice in pipeline.slice_ids() {
        for file in [INPUT_FILE, OUTPUT_FILE, PROOF_FILE] {
            assert!(run_dir.join(slice.to_string()).join(file).is_file(), "{slice}/{file}");
        }
    }

    let results: RunResults =
        serde_json::from_slice(&fs::read(run_dir.join(RUN_RESULTS_FILE)).expect("results"))
            .expect("parse results");
    assert_eq!(results.run_id, outcome.run_id.to_string());
    assert!(results.is_complete(&pipeline.slice_ids()));
    for attempt in &results.slices {
        assert_eq!(attempt.attempt, 1);
        assert!(attempt.timings_ms.witness.is_some());
        assert!(attempt.timings_ms.proof.is_some());
        assert!(attempt.timings_ms.verify.is_some());
    }

    let metadata: RunMetadata = serde_json::from_slice(
        &fs::read(root.path().join("run").join(METADATA_FILE)).expect("metadata"),
    )
    .expect("parse metadata");
    assert_eq!(metadata.slices_dir, "slices/");

    let proofs: Vec<SliceProof> = run.proofs().into_iter().map(|(_, proof)| proof).collect();
    let verdict = verify_chain(&pipeline.verifying_keys(), &proofs).expect("verdict");
    assert!(verdict.accepted());
    assert_eq!(verdict.links, vec![true; 4]);
}

#[test]
fn corrupted_hand_off_fails_the_next_slice() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), SyntheticModel::default());
    let pipeline = load(root.path(), PipelineOptions::default());
    let mut run = pipeline.start_run().expect("start run");

    assert!(run
        .run_slice(0, InputContext::Seed(b"hand-off".to_vec()))
        .expect("slice 0"));
    for index in 1..=2 {
        assert!(run
            .run_slice(index, InputContext::PreviousOutput)
            .expect("slice"));
    }

    let output_path = run.record().slice_dir(SliceId(2)).join(OUTPUT_FILE);
    let file: OutputFile =
        serde_json::from_slice(&fs::read(&output_path).expect("read output")).expect("parse");
    let mut data = file.output_data.data().to_vec();
    data[0] += 0.5;
    let tampered = OutputFile {
        output_data: Tensor::new(file.output_data.shape().to_vec(), data).expect("tensor"),
    };
    fs::write(&output_path, serde_json::to_vec(&tampered).expect("json")).expect("tamper");

    let err = run
        .generate_input(3, InputContext::PreviousOutput)
        .expect_err("continuity");
    assert!(matches!(
        err,
        PipelineError::Execution {
            stage: Stage::Input,
            ..
        }
    ));
    assert_eq!(err.slice(), Some(SliceId(3)));
    assert_eq!(run.status(3), Some(SliceStatus::Failed));

    let failed = run
        .record()
        .results()
        .latest(SliceId(3))
        .expect("slice 3 entry");
    assert_eq!(failed.status, SliceStatus::Failed);
    let failure = failed.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, "execution");
    assert_eq!(failure.stage, Stage::Input);
    assert!(run.record().dir().is_dir());
}

#[test]
fn wrong_input_shape_fails_before_proving() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(
        root.path(),
        SyntheticModel {
            slices: 1,
            width: 2,
            hidden: 1,
            input_shape: Some(vec![1, 3, 224, 224]),
            ..SyntheticModel::default()
        },
    );
    let pipeline = load(root.path(), PipelineOptions::default());
    let mut run = pipeline.start_run().expect("start run");

    let input = Tensor::new(vec![1, 3, 32, 32], vec![0.0; 3 * 32 * 32]).expect("tensor");
    run.generate_input(0, InputContext::Sample(input))
        .expect("input is written as given");
    let err = run.generate_witness(0).expect_err("shape mismatch");
    assert!(matches!(
        err,
        PipelineError::Execution {
            stage: Stage::Witness,
            ..
        }
    ));
    assert_eq!(run.status(0), Some(SliceStatus::Failed));
    let slice_dir = run.record().slice_dir(SliceId(0));
    assert!(!slice_dir.join(OUTPUT_FILE).exists());
    assert!(!slice_dir.join(PROOF_FILE).exists());
}

#[test]
fn out_of_order_calls_have_no_side_effects() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), small_model(2));
    let pipeline = load(root.path(), PipelineOptions::default());
    let mut run = pipeline.start_run().expect("start run");

    for err in [
        run.verify(0).expect_err("verify first"),
        run.generate_witness(1).expect_err("witness first"),
    ] {
        assert!(matches!(err, PipelineError::OutOfOrder { .. }));
    }
    assert!(matches!(
        run.retry_slice(0),
        Err(PipelineError::OutOfOrder {
            stage: Stage::Retry,
            ..
        })
    ));
    assert!(!run.record().results_path().exists());
    assert_eq!(run.status(0), Some(SliceStatus::Created));
}

#[test]
fn proving_timeout_fails_the_slice_and_retry_opens_a_new_attempt() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), small_model(1));
    let options = PipelineOptions {
        prover: ProverConfig {
            max_proving_time: Some(Duration::ZERO),
        },
        ..PipelineOptions::default()
    };
    let pipeline = load(root.path(), options);
    let mut run = pipeline.start_run().expect("start run");

    run.generate_input(0, InputContext::Seed(b"slow".to_vec()))
        .expect("input");
    run.generate_witness(0).expect("witness");
    let err = run.gen_proof(0).expect_err("timeout");
    assert!(matches!(
        err,
        PipelineError::Timeout {
            stage: Stage::Proof,
            ..
        }
    ));
    assert_eq!(run.status(0), Some(SliceStatus::Failed));
    let failure = run
        .record()
        .results()
        .latest(SliceId(0))
        .and_then(|attempt| attempt.failure.clone())
        .expect("failure recorded");
    assert_eq!(failure.kind, "timeout");

    run.retry_slice(0).expect("retry");
    assert_eq!(run.status(0), Some(SliceStatus::Created));
    let attempts: Vec<_> = run.record().results().attempts(SliceId(0)).collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].attempt, 2);
    assert_eq!(attempts[1].status, SliceStatus::Created);
}

#[test]
fn independent_runs_proceed_concurrently() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), small_model(2));
    let pipeline = load(root.path(), PipelineOptions::default());

    let ids: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    let mut run = pipeline.start_run().expect("start run");
                    let outcome = run
                        .run_all(InputContext::Seed(vec![n]))
                        .expect("chain run");
                    assert!(outcome.complete);
                    outcome.run_id
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker"))
            .collect()
    });
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn swapped_or_tampered_proofs_are_not_accepted() {
    let root = tempfile::tempdir().expect("tempdir");
    write_model(root.path(), small_model(3));
    let pipeline = load(root.path(), PipelineOptions::default());
    let mut run = pipeline.start_run().expect("start run");
    run.run_all(InputContext::Seed(b"tamper".to_vec()))
        .expect("chain run");
    let proofs: Vec<SliceProof> = run.proofs().into_iter().map(|(_, proof)| proof).collect();

    let mut tampered = proofs.clone();
    tampered[1].bytes[100] ^= 0x01;
    let verdict = verify_chain(&pipeline.verifying_keys(), &tampered).expect("verdict");
    assert_eq!(verdict.slices, vec![true, false, true]);
    assert!(!verdict.accepted());

    let err = verify_chain(&pipeline.verifying_keys(), &proofs[..2]).expect_err("count");
    assert!(matches!(err, PipelineError::Configuration(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn identical_input_writes_identical_output(seed in proptest::collection::vec(any::<u8>(), 1..16)) {
        let root = tempfile::tempdir().expect("tempdir");
        write_model(root.path(), small_model(1));
        let pipeline = load(root.path(), PipelineOptions::default());

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let mut run = pipeline.start_run().expect("start run");
            run.generate_input(0, InputContext::Seed(seed.clone())).expect("input");
            run.generate_witness(0).expect("witness");
            let path = run.record().slice_dir(SliceId(0)).join(OUTPUT_FILE);
            outputs.push(fs::read(path).expect("output"));
        }
        prop_assert_eq!(&outputs[0], &outputs[1]);
    }
}
