//! Proving and verifying keys of the attestation backend.
//!
//! A proving key carries the ML-DSA-65 seed that signs proof transcripts for
//! exactly one circuit digest; the verifying key carries the matching public
//! key. Both are serialized with bincode into `pk.key` / `vk.key`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slice_crypto::ml_dsa::{MlDsaPublicKey, MlDsaSecretKey};
use slice_crypto::traits::{SigningKey, VerifyKey};
use slice_crypto::Digest32;

use crate::circuit::CompiledCircuit;
use crate::constants::KEY_FORMAT_VERSION;
use crate::error::SliceCircuitError;
use crate::settings::CircuitSettings;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProvingKeyRepr", into = "ProvingKeyRepr")]
pub struct ProvingKey {
    circuit_digest: Digest32,
    signing_key: MlDsaSecretKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VerifyingKeyRepr", into = "VerifyingKeyRepr")]
pub struct VerifyingKey {
    circuit_digest: Digest32,
    key: MlDsaPublicKey,
}

impl ProvingKey {
    pub fn circuit_digest(&self) -> Digest32 {
        self.circuit_digest
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            circuit_digest: self.circuit_digest,
            key: self.signing_key.verify_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &MlDsaSecretKey {
        &self.signing_key
    }

    pub fn load(path: &Path) -> Result<Self, SliceCircuitError> {
        let bytes = fs::read(path).map_err(|err| SliceCircuitError::io(path, err))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SliceCircuitError> {
        Ok(bincode::serialize(self)?)
    }
}

impl VerifyingKey {
    pub fn circuit_digest(&self) -> Digest32 {
        self.circuit_digest
    }

    pub(crate) fn key(&self) -> &MlDsaPublicKey {
        &self.key
    }

    /// Short identifier for logs and run metadata.
    pub fn fingerprint(&self) -> Digest32 {
        self.key.fingerprint()
    }

    pub fn load(path: &Path) -> Result<Self, SliceCircuitError> {
        let bytes = fs::read(path).map_err(|err| SliceCircuitError::io(path, err))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SliceCircuitError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SliceCircuitError> {
        Ok(bincode::serialize(self)?)
    }
}

/// Derive the key pair for a validated circuit.
///
/// The signing seed is bound to the circuit digest, so one setup seed yields
/// distinct keys for every slice.
pub fn setup(
    settings: &CircuitSettings,
    circuit: &CompiledCircuit,
    seed: &[u8],
) -> Result<(ProvingKey, VerifyingKey), SliceCircuitError> {
    circuit.validate(settings)?;
    let circuit_digest = circuit.digest(settings)?;
    let mut material = Vec::with_capacity(seed.len() + 32);
    material.extend_from_slice(seed);
    material.extend_from_slice(circuit_digest.as_bytes());
    let proving = ProvingKey {
        circuit_digest,
        signing_key: MlDsaSecretKey::generate_deterministic(&material),
    };
    let verifying = proving.verifying_key();
    Ok((proving, verifying))
}

#[derive(Serialize, Deserialize)]
struct ProvingKeyRepr {
    version: u32,
    circuit_digest: [u8; 32],
    seed: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct VerifyingKeyRepr {
    version: u32,
    circuit_digest: [u8; 32],
    public_key: Vec<u8>,
}

impl From<ProvingKey> for ProvingKeyRepr {
    fn from(key: ProvingKey) -> Self {
        Self {
            version: KEY_FORMAT_VERSION,
            circuit_digest: key.circuit_digest.0,
            seed: key.signing_key.to_bytes(),
        }
    }
}

impl TryFrom<ProvingKeyRepr> for ProvingKey {
    type Error = String;

    fn try_from(repr: ProvingKeyRepr) -> Result<Self, Self::Error> {
        if repr.version != KEY_FORMAT_VERSION {
            return Err(format!("unsupported proving key version {}", repr.version));
        }
        let signing_key = MlDsaSecretKey::from_bytes(&repr.seed).map_err(|err| err.to_string())?;
        Ok(Self {
            circuit_digest: Digest32(repr.circuit_digest),
            signing_key,
        })
    }
}

impl From<VerifyingKey> for VerifyingKeyRepr {
    fn from(key: VerifyingKey) -> Self {
        Self {
            version: KEY_FORMAT_VERSION,
            circuit_digest: key.circuit_digest.0,
            public_key: key.key.to_bytes(),
        }
    }
}

impl TryFrom<VerifyingKeyRepr> for VerifyingKey {
    type Error = String;

    fn try_from(repr: VerifyingKeyRepr) -> Result<Self, Self::Error> {
        if repr.version != KEY_FORMAT_VERSION {
            return Err(format!("unsupported verifying key version {}", repr.version));
        }
        let key = MlDsaPublicKey::from_bytes(&repr.public_key).map_err(|err| err.to_string())?;
        Ok(Self {
            circuit_digest: Digest32(repr.circuit_digest),
            key,
        })
    }
}
