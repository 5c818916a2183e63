use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slice_crypto::hashes::PROOF_DOMAIN;
use slice_crypto::{Digest32, Transcript};

use crate::error::{SliceCircuitError, SliceVerifyError};
use crate::public_inputs::PublicInstances;

/// Proof bytes together with the instances they were produced for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceProof {
    pub bytes: Vec<u8>,
    pub instances: PublicInstances,
}

/// JSON form written to `proof.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofFile {
    pub proof: String,
    pub instances: Vec<String>,
}

impl SliceProof {
    pub fn to_file(&self) -> ProofFile {
        ProofFile {
            proof: hex::encode(&self.bytes),
            instances: self.instances.to_strings(),
        }
    }

    pub fn from_file(file: &ProofFile) -> Result<Self, SliceVerifyError> {
        let proof = file.proof.strip_prefix("0x").unwrap_or(&file.proof);
        let bytes = hex::decode(proof)
            .map_err(|err| SliceVerifyError::InvalidProofFormat(format!("proof hex: {err}")))?;
        let instances = PublicInstances::from_strings(&file.instances)?;
        Ok(Self { bytes, instances })
    }
}

impl ProofFile {
    pub fn load(path: &Path) -> Result<Self, SliceCircuitError> {
        let bytes = fs::read(path).map_err(|err| SliceCircuitError::io(path, err))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Message signed by the prover and checked by the verifier.
pub(crate) fn proof_transcript(
    circuit_digest: &Digest32,
    instances: &PublicInstances,
    trace_commitment: &Digest32,
) -> Digest32 {
    let mut transcript = Transcript::new(PROOF_DOMAIN);
    transcript.absorb_digest(circuit_digest);
    for instance in instances.as_array() {
        transcript.absorb_digest(&instance);
    }
    transcript.absorb_digest(trace_commitment);
    transcript.finalize()
}
