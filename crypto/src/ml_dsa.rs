//! ML-DSA-65 (FIPS 204) signing keys.
//!
//! Wraps the `ml-dsa` crate. The secret key is stored as its 32-byte seed
//! (`xi` in FIPS 204), which is what ships inside a slice proving key; the
//! expanded lattice key is re-derived on demand.

use ml_dsa::signature::{Signer, Verifier};
use ml_dsa::{Keypair, MlDsa65, B32};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::traits::{Signature as SigTrait, SigningKey as SigningKeyTrait, VerifyKey};

/// ML-DSA-65 parameter sizes (FIPS 204)
pub const ML_DSA_PUBLIC_KEY_LEN: usize = 1952;
pub const ML_DSA_SEED_LEN: usize = 32;
pub const ML_DSA_SIGNATURE_LEN: usize = 3309;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MlDsaSignature {
    bytes: Vec<u8>,
}

impl MlDsaSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_DSA_SIGNATURE_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_DSA_SIGNATURE_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

impl SigTrait for MlDsaSignature {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// ML-DSA-65 public key (verification key).
#[derive(Clone, Debug)]
pub struct MlDsaPublicKey {
    bytes: [u8; ML_DSA_PUBLIC_KEY_LEN],
}

impl MlDsaPublicKey {
    fn to_inner(&self) -> ml_dsa::VerifyingKey<MlDsa65> {
        ml_dsa::VerifyingKey::<MlDsa65>::decode(&self.bytes.into())
    }
}

impl PartialEq for MlDsaPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for MlDsaPublicKey {}

impl VerifyKey for MlDsaPublicKey {
    type Signature = MlDsaSignature;

    fn verify(&self, message: &[u8], signature: &Self::Signature) -> Result<(), CryptoError> {
        let sig_bytes: [u8; ML_DSA_SIGNATURE_LEN] = signature
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        // Hint encodings can be malformed after tampering; decode rejects them.
        let sig = ml_dsa::Signature::<MlDsa65>::decode(&sig_bytes.into())
            .ok_or(CryptoError::InvalidSignature)?;

        self.to_inner()
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; ML_DSA_PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: ML_DSA_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes: arr })
    }
}

/// ML-DSA-65 secret key, kept as its seed and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MlDsaSecretKey {
    xi: [u8; ML_DSA_SEED_LEN],
}

impl MlDsaSecretKey {
    fn to_inner(&self) -> ml_dsa::SigningKey<MlDsa65> {
        let seed: B32 = self.xi.into();
        ml_dsa::SigningKey::<MlDsa65>::from_seed(&seed)
    }
}

impl core::fmt::Debug for MlDsaSecretKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MlDsaSecretKey").finish_non_exhaustive()
    }
}

impl PartialEq for MlDsaSecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.xi == other.xi
    }
}

impl Eq for MlDsaSecretKey {}

impl SigningKeyTrait for MlDsaSecretKey {
    type VerifyKey = MlDsaPublicKey;
    type Signature = MlDsaSignature;

    fn generate_deterministic(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"ml-dsa-65-xi");
        hasher.update(seed);
        let mut xi = [0u8; ML_DSA_SEED_LEN];
        xi.copy_from_slice(&hasher.finalize());
        Self { xi }
    }

    fn sign(&self, message: &[u8]) -> Self::Signature {
        let sig = self.to_inner().sign(message);
        MlDsaSignature {
            bytes: sig.encode().to_vec(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.xi.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let xi: [u8; ML_DSA_SEED_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: ML_DSA_SEED_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self { xi })
    }

    fn verify_key(&self) -> Self::VerifyKey {
        let sk = self.to_inner();
        let vk_bytes = sk.verifying_key().encode();
        let mut bytes = [0u8; ML_DSA_PUBLIC_KEY_LEN];
        bytes.copy_from_slice(vk_bytes.as_ref());
        MlDsaPublicKey { bytes }
    }
}
