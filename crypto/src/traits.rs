use crate::error::CryptoError;
use crate::hashes::{blake3_256, Digest32};

pub trait Signature: Sized + Clone {
    fn as_bytes(&self) -> &[u8];
    fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

/// Secret half of a signing key pair. Only the prover side ever holds one.
pub trait SigningKey: Sized {
    type VerifyKey: VerifyKey<Signature = Self::Signature>;
    type Signature: Signature;

    fn generate_deterministic(seed: &[u8]) -> Self;
    fn sign(&self, message: &[u8]) -> Self::Signature;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError>;
    fn verify_key(&self) -> Self::VerifyKey;
}

pub trait VerifyKey: Sized + Clone {
    type Signature: Signature;

    fn verify(&self, message: &[u8], signature: &Self::Signature) -> Result<(), CryptoError>;
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError>;

    /// Stable identifier of the public key, safe to log and to bind into transcripts.
    fn fingerprint(&self) -> Digest32 {
        Digest32(blake3_256(&self.to_bytes()))
    }
}
