//! Single-slice handler driven through the run directory only.

use std::fs;
use std::path::Path;

use slice_circuit::synthetic::SyntheticModel;
use slice_circuit::{ProofFile, SliceId, Tensor};
use slice_pipeline::input::{OutputFile, OUTPUT_FILE, PROOF_FILE};
use slice_pipeline::{PipelineConfig, PipelineError, Session, SliceHandler, SliceStatus, Stage};

fn handler(model_root: &Path) -> SliceHandler {
    SyntheticModel {
        slices: 1,
        ..SyntheticModel::default()
    }
    .write(model_root)
    .expect("write model");
    let config = PipelineConfig {
        model_root: Some(model_root.to_path_buf()),
        ..PipelineConfig::default()
    };
    SliceHandler::new(&config.resolve_handler().expect("resolve")).expect("handler")
}

fn sample() -> Tensor {
    Tensor::new(vec![1, 8], (0..8u8).map(|i| f64::from(i) / 16.0).collect()).expect("tensor")
}

#[test]
fn handler_walks_one_slice_through_every_stage() {
    let root = tempfile::tempdir().expect("tempdir");
    let handler = handler(root.path());
    let mut session = Session::new();

    let input_path = handler
        .gen_input_file(&mut session, &sample())
        .expect("input file");
    let run_id = session.run_id.expect("run created");
    assert!(input_path.starts_with(root.path().join("run").join(run_id.to_string())));

    // A fresh session attaches to the latest run.
    let mut attached = Session::new();
    let results = handler.generate_witness(&mut attached).expect("witness");
    assert_eq!(attached.run_id, Some(run_id));
    assert_eq!(
        results.latest_status(SliceId(0)),
        Some(SliceStatus::WitnessGenerated)
    );

    let (proof_json, instances_json) = handler.gen_proof(&mut session).expect("proof");
    let proof: ProofFile = serde_json::from_str(&proof_json).expect("proof json");
    let instances: Vec<String> = serde_json::from_str(&instances_json).expect("instances json");
    assert_eq!(proof.instances, instances);
    assert_eq!(instances.len(), 3);

    let on_disk: ProofFile = serde_json::from_slice(
        &fs::read(input_path.with_file_name(PROOF_FILE)).expect("proof.json"),
    )
    .expect("parse proof.json");
    assert_eq!(on_disk, proof);

    assert!(handler
        .verify_proof(&mut session, Some(sample()), &proof)
        .expect("verify"));
    let run = handler
        .run_manager()
        .open_run(&run_id)
        .expect("reopen run");
    assert_eq!(
        run.results().latest_status(SliceId(0)),
        Some(SliceStatus::Verified)
    );
}

#[test]
fn proof_replayed_for_another_input_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let handler = handler(root.path());
    let mut session = Session::new();
    handler
        .gen_input_file(&mut session, &sample())
        .expect("input");
    handler.generate_witness(&mut session).expect("witness");
    let (proof_json, _) = handler.gen_proof(&mut session).expect("proof");
    let proof: ProofFile = serde_json::from_str(&proof_json).expect("proof json");

    let other = Tensor::new(vec![1, 8], vec![0.5; 8]).expect("tensor");
    assert!(!handler
        .verify_proof(&mut session, Some(other), &proof)
        .expect("verify"));

    let run = handler
        .run_manager()
        .get_latest_run()
        .expect("latest run");
    let latest = run.results().latest(SliceId(0)).expect("entry");
    assert_eq!(latest.status, SliceStatus::Failed);
    assert_eq!(
        latest.failure.as_ref().map(|failure| failure.kind.as_str()),
        Some("rejected")
    );
}

#[test]
fn edited_output_is_caught_before_proving() {
    let root = tempfile::tempdir().expect("tempdir");
    let handler = handler(root.path());
    let mut session = Session::new();
    let input_path = handler
        .gen_input_file(&mut session, &sample())
        .expect("input");
    handler.generate_witness(&mut session).expect("witness");

    let output_path = input_path.with_file_name(OUTPUT_FILE);
    let file: OutputFile =
        serde_json::from_slice(&fs::read(&output_path).expect("output")).expect("parse");
    let mut data = file.output_data.data().to_vec();
    data[0] += 1.0;
    let edited = OutputFile {
        output_data: Tensor::new(file.output_data.shape().to_vec(), data).expect("tensor"),
    };
    fs::write(&output_path, serde_json::to_vec(&edited).expect("json")).expect("edit");

    let err = handler.gen_proof(&mut session).expect_err("edited output");
    assert!(matches!(
        err,
        PipelineError::Execution {
            stage: Stage::Proof,
            ..
        }
    ));
    assert!(!input_path.with_file_name(PROOF_FILE).exists());
}

#[test]
fn malformed_proof_is_a_verification_error() {
    let root = tempfile::tempdir().expect("tempdir");
    let handler = handler(root.path());
    let proof = ProofFile {
        proof: "00".repeat(10),
        instances: Vec::new(),
    };
    let err = handler
        .verify_proof(&mut Session::new(), None, &proof)
        .expect_err("structural");
    assert!(matches!(err, PipelineError::Verification { .. }));
}
