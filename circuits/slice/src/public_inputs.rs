use serde::{Deserialize, Serialize};
use slice_crypto::Digest32;

use crate::constants::INSTANCE_COUNT;
use crate::error::SliceVerifyError;

/// Public instances of a slice proof, in wire order:
/// `[input_commitment, output_commitment, circuit_digest]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicInstances {
    pub input_commitment: Digest32,
    pub output_commitment: Digest32,
    pub circuit_digest: Digest32,
}

impl PublicInstances {
    pub fn to_strings(&self) -> Vec<String> {
        self.as_array().iter().map(Digest32::to_hex).collect()
    }

    pub fn as_array(&self) -> [Digest32; INSTANCE_COUNT] {
        [
            self.input_commitment,
            self.output_commitment,
            self.circuit_digest,
        ]
    }

    /// Parse the hex rendering used in `proof.json`.
    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Result<Self, SliceVerifyError> {
        if values.len() != INSTANCE_COUNT {
            return Err(SliceVerifyError::InvalidPublicInstances(format!(
                "expected {INSTANCE_COUNT} instances, got {}",
                values.len()
            )));
        }
        let mut parsed = [Digest32::ZERO; INSTANCE_COUNT];
        for (slot, value) in parsed.iter_mut().zip(values) {
            *slot = Digest32::from_hex(value.as_ref()).map_err(|err| {
                SliceVerifyError::InvalidPublicInstances(format!(
                    "instance {:?}: {err}",
                    value.as_ref()
                ))
            })?;
        }
        Ok(Self {
            input_commitment: parsed[0],
            output_commitment: parsed[1],
            circuit_digest: parsed[2],
        })
    }

    /// Instances with the input commitment replaced, e.g. by a verifier that
    /// holds the input tensor itself.
    pub fn with_input_commitment(mut self, commitment: Digest32) -> Self {
        self.input_commitment = commitment;
        self
    }
}

impl Serialize for PublicInstances {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_strings().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicInstances {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = Vec::<String>::deserialize(deserializer)?;
        Self::from_strings(&values).map_err(serde::de::Error::custom)
    }
}
