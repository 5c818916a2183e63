use slice_crypto::ml_dsa::MlDsaSignature;
use slice_crypto::traits::VerifyKey;
use slice_crypto::Digest32;

use crate::constants::{PROOF_LEN, TRACE_COMMITMENT_LEN};
use crate::error::SliceVerifyError;
use crate::keys::VerifyingKey;
use crate::proof::{proof_transcript, ProofFile, SliceProof};
use crate::public_inputs::PublicInstances;
use crate::settings::CircuitSettings;
use crate::tensor::Tensor;

/// Check `proof` against `instances` using only the verifying key.
///
/// Structural problems are errors. A well-formed proof that does not check
/// out, including one carrying a digest for another circuit, is `Ok(false)`.
pub fn verify(
    verifying_key: &VerifyingKey,
    instances: &PublicInstances,
    proof: &[u8],
) -> Result<bool, SliceVerifyError> {
    if proof.len() != PROOF_LEN {
        return Err(SliceVerifyError::InvalidProofFormat(format!(
            "expected {PROOF_LEN} bytes, got {}",
            proof.len()
        )));
    }
    if instances.circuit_digest != verifying_key.circuit_digest() {
        return Ok(false);
    }
    let (commitment_bytes, signature_bytes) = proof.split_at(TRACE_COMMITMENT_LEN);
    let trace_commitment = Digest32::from_slice(commitment_bytes)
        .map_err(|err| SliceVerifyError::InvalidProofFormat(err.to_string()))?;
    let signature = MlDsaSignature::from_bytes(signature_bytes)
        .map_err(|err| SliceVerifyError::InvalidProofFormat(err.to_string()))?;

    let message = proof_transcript(
        &verifying_key.circuit_digest(),
        instances,
        &trace_commitment,
    );
    Ok(verifying_key
        .key()
        .verify(message.as_bytes(), &signature)
        .is_ok())
}

/// Verify the JSON rendering written to `proof.json`.
pub fn verify_file(verifying_key: &VerifyingKey, file: &ProofFile) -> Result<bool, SliceVerifyError> {
    let proof = SliceProof::from_file(file)?;
    verify(verifying_key, &proof.instances, &proof.bytes)
}

/// Rebind the input instance to a tensor the verifier holds.
///
/// The tensor goes through the same shape rule as witness generation, so a
/// flat list of the right length commits like its reshaped form.
pub fn bind_input(
    instances: PublicInstances,
    settings: &CircuitSettings,
    input: Tensor,
) -> Result<PublicInstances, SliceVerifyError> {
    let input = settings
        .conform_input(input)
        .map_err(|err| SliceVerifyError::InvalidPublicInstances(err.to_string()))?;
    Ok(instances.with_input_commitment(input.commitment()))
}
