use std::fs;
use std::sync::atomic::AtomicBool;

use proptest::prelude::*;
use slice_circuit::constants::{PROOF_LEN, VERIFYING_KEY_FILE};
use slice_circuit::synthetic::SyntheticModel;
use slice_circuit::{
    bind_input, gen_proof, gen_proof_cancellable, generate_witness, verify, verify_file,
    PublicInstances, SliceBundle, SliceCircuitError, SliceVerifyError, Tensor,
};
use slice_crypto::Digest32;

fn model(slices: u32) -> Vec<SliceBundle> {
    SyntheticModel {
        slices,
        ..SyntheticModel::default()
    }
    .bundles()
    .expect("synthetic bundles")
}

fn sample_input(width: usize) -> Tensor {
    let data = (0..width).map(|i| i as f64 / width as f64).collect();
    Tensor::new(vec![1, width], data).expect("input tensor")
}

#[test]
fn witness_proof_verify_roundtrip() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let witness = generate_witness(bundle, sample_input(8)).expect("witness");
    let proof = gen_proof(bundle, &witness.trace).expect("proof");

    assert_eq!(proof.bytes.len(), PROOF_LEN);
    assert_eq!(proof.instances.input_commitment, witness.input_commitment);
    assert_eq!(proof.instances.output_commitment, witness.output_commitment);
    assert_eq!(proof.instances.circuit_digest, bundle.circuit_digest());

    // Only the verifying key, instances and proof bytes are needed.
    let vk = bundle.verifying_key().clone();
    drop(bundles);
    assert_eq!(verify(&vk, &proof.instances, &proof.bytes), Ok(true));
    assert_eq!(verify_file(&vk, &proof.to_file()), Ok(true));
}

#[test]
fn reproving_the_same_trace_verifies_against_the_same_instances() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let witness = generate_witness(bundle, sample_input(8)).expect("witness");
    let first = gen_proof(bundle, &witness.trace).expect("first proof");
    let second = gen_proof(bundle, &witness.trace).expect("second proof");
    assert_eq!(first.instances, second.instances);
    assert_eq!(verify(bundle.verifying_key(), &second.instances, &second.bytes), Ok(true));
}

#[test]
fn flat_input_commits_like_its_reshaped_form() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let nested = sample_input(8);
    let flat = nested.clone().reshape(vec![8]).expect("flat");
    let a = generate_witness(bundle, nested).expect("nested witness");
    let b = generate_witness(bundle, flat).expect("flat witness");
    assert_eq!(a.input_commitment, b.input_commitment);
    assert_eq!(a.output, b.output);
}

#[test]
fn wrong_shape_fails_before_proving() {
    let bundles = model(1);
    let err = generate_witness(&bundles[0], sample_input(5)).expect_err("shape mismatch");
    assert!(matches!(err, SliceCircuitError::ShapeMismatch { .. }));
}

#[test]
fn instances_for_another_circuit_are_rejected() {
    let bundles = model(2);
    let witness = generate_witness(&bundles[0], sample_input(8)).expect("witness");
    let proof = gen_proof(&bundles[0], &witness.trace).expect("proof");

    assert_eq!(verify(bundles[1].verifying_key(), &proof.instances, &proof.bytes), Ok(false));

    let foreign = PublicInstances {
        circuit_digest: bundles[1].circuit_digest(),
        ..proof.instances
    };
    assert_eq!(verify(bundles[0].verifying_key(), &foreign, &proof.bytes), Ok(false));
}

#[test]
fn tampered_instances_are_rejected() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let witness = generate_witness(bundle, sample_input(8)).expect("witness");
    let proof = gen_proof(bundle, &witness.trace).expect("proof");

    let mut other_output = proof.instances;
    other_output.output_commitment = Digest32([7u8; 32]);
    assert_eq!(verify(bundle.verifying_key(), &other_output, &proof.bytes), Ok(false));
}

#[test]
fn structural_problems_are_errors() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let witness = generate_witness(bundle, sample_input(8)).expect("witness");
    let proof = gen_proof(bundle, &witness.trace).expect("proof");

    let short = &proof.bytes[..PROOF_LEN - 1];
    assert!(matches!(
        verify(bundle.verifying_key(), &proof.instances, short),
        Err(SliceVerifyError::InvalidProofFormat(_))
    ));

    let mut file = proof.to_file();
    file.instances.pop();
    assert!(matches!(
        verify_file(bundle.verifying_key(), &file),
        Err(SliceVerifyError::InvalidPublicInstances(_))
    ));

    let mut file = proof.to_file();
    file.proof.push_str("zz");
    assert!(matches!(
        verify_file(bundle.verifying_key(), &file),
        Err(SliceVerifyError::InvalidProofFormat(_))
    ));
}

#[test]
fn verifier_supplied_input_rebinds_the_first_instance() {
    let bundles = model(1);
    let bundle = &bundles[0];
    let input = sample_input(8);
    let witness = generate_witness(bundle, input.clone()).expect("witness");
    let proof = gen_proof(bundle, &witness.trace).expect("proof");

    let honest = bind_input(proof.instances, bundle.settings(), input).expect("bind");
    assert_eq!(verify(bundle.verifying_key(), &honest, &proof.bytes), Ok(true));

    let other = Tensor::new(vec![1, 8], vec![0.5; 8]).expect("other input");
    let replayed = bind_input(proof.instances, bundle.settings(), other).expect("bind");
    assert_eq!(verify(bundle.verifying_key(), &replayed, &proof.bytes), Ok(false));

    assert!(bind_input(proof.instances, bundle.settings(), sample_input(3)).is_err());
}

#[test]
fn prover_rejects_foreign_and_forged_traces() {
    let bundles = model(2);
    let witness = generate_witness(&bundles[0], sample_input(8)).expect("witness");

    let err = gen_proof(&bundles[1], &witness.trace).expect_err("key mismatch");
    assert!(matches!(err, SliceCircuitError::KeyMismatch { .. }));

    let mut forged = witness.trace.clone();
    if let Some(last) = forged.activations.last_mut() {
        last[0] += 1;
    }
    let err = gen_proof(&bundles[0], &forged).expect_err("forged trace");
    assert!(matches!(err, SliceCircuitError::MalformedTrace(_)));

    let mut truncated = witness.trace.clone();
    truncated.activations.pop();
    let err = gen_proof(&bundles[0], &truncated).expect_err("truncated trace");
    assert!(matches!(err, SliceCircuitError::MalformedTrace(_)));
}

#[test]
fn cancelled_prover_stops() {
    let bundles = model(1);
    let witness = generate_witness(&bundles[0], sample_input(8)).expect("witness");
    let err = gen_proof_cancellable(&bundles[0], &witness.trace, &AtomicBool::new(true))
        .expect_err("cancelled");
    assert!(matches!(err, SliceCircuitError::Cancelled));
}

#[test]
fn bundle_directory_roundtrip_and_pairing_checks() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let bundles = model(2);
    let dir0 = bundles[0].write(&tmp.path().join("slice_0")).expect("write slice_0");
    let dir1 = bundles[1].write(&tmp.path().join("slice_1")).expect("write slice_1");

    let loaded = SliceBundle::load(&dir0).expect("load slice_0");
    assert_eq!(loaded.circuit_digest(), bundles[0].circuit_digest());
    assert_eq!(loaded.verifying_key(), bundles[0].verifying_key());

    // vk from another slice
    fs::copy(dir1.join(VERIFYING_KEY_FILE), dir0.join(VERIFYING_KEY_FILE)).expect("swap vk");
    let err = SliceBundle::load(&dir0).expect_err("mismatched vk");
    assert!(matches!(err, SliceCircuitError::InvalidBundle { .. }));

    // directory index disagrees with settings
    let misplaced = tmp.path().join("slice_7");
    bundles[1].write(&misplaced).expect("write misplaced");
    let err = SliceBundle::load(&misplaced).expect_err("index mismatch");
    assert!(matches!(err, SliceCircuitError::InvalidBundle { .. }));

    let err = SliceBundle::load(&tmp.path().join("missing")).expect_err("missing bundle");
    assert!(matches!(err, SliceCircuitError::InvalidBundle { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn single_bit_flip_never_verifies(bit in 0usize..PROOF_LEN * 8) {
        let bundles = model(1);
        let bundle = &bundles[0];
        let witness = generate_witness(bundle, sample_input(8)).expect("witness");
        let proof = gen_proof(bundle, &witness.trace).expect("proof");

        let mut flipped = proof.bytes.clone();
        flipped[bit / 8] ^= 1 << (bit % 8);
        prop_assert_eq!(verify(bundle.verifying_key(), &proof.instances, &flipped), Ok(false));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]
    #[test]
    fn witness_generation_is_deterministic(values in prop::collection::vec(0.0f64..1.0, 8)) {
        let bundles = model(1);
        let input = Tensor::new(vec![1, 8], values).expect("input");
        let a = generate_witness(&bundles[0], input.clone()).expect("first");
        let b = generate_witness(&bundles[0], input).expect("second");
        prop_assert_eq!(&a.trace, &b.trace);
        prop_assert_eq!(a.output_commitment, b.output_commitment);
        let a_json = serde_json::to_string(&a.output).expect("json");
        let b_json = serde_json::to_string(&b.output).expect("json");
        prop_assert_eq!(a_json, b_json);
    }
}
