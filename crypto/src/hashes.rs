use core::fmt;
use core::str::FromStr;

use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Domain tag for tensor commitments (inputs and outputs of a slice).
pub const TENSOR_DOMAIN: &[u8] = b"slice-tensor/v1";

/// Domain tag for commitments over a private execution trace.
pub const TRACE_DOMAIN: &[u8] = b"slice-trace/v1";

/// Domain tag for the signed proof transcript.
pub const PROOF_DOMAIN: &[u8] = b"slice-proof/v1";

/// Domain tag for circuit digests (settings + compiled circuit).
pub const CIRCUIT_DOMAIN: &[u8] = b"slice-circuit/v1";

/// A 32-byte hash output, rendered as lowercase hex in JSON artifacts.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let trimmed = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(trimmed)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Digest32 {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Digest32 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Serialize for Digest32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest32 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Digest32::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Incremental, domain-separated hasher.
///
/// Every absorbed item is length-prefixed so that adjacent fields can never
/// be re-split into a colliding encoding.
#[derive(Clone)]
pub struct Transcript {
    hasher: Blake3Hasher,
}

impl Transcript {
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Blake3Hasher::new();
        hasher.update(&(domain.len() as u64).to_le_bytes());
        hasher.update(domain);
        Self { hasher }
    }

    pub fn absorb_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn absorb_digest(&mut self, digest: &Digest32) -> &mut Self {
        self.hasher.update(&digest.0);
        self
    }

    pub fn absorb_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn absorb_i64s(&mut self, values: &[i64]) -> &mut Self {
        self.absorb_u64(values.len() as u64);
        for value in values {
            self.hasher.update(&value.to_le_bytes());
        }
        self
    }

    pub fn finalize(&self) -> Digest32 {
        let mut out = [0u8; 32];
        self.hasher.finalize_xof().fill(&mut out);
        Digest32(out)
    }
}

pub fn blake3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake3Hasher::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize_xof().fill(&mut out);
    out
}
