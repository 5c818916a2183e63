//! Cryptographic primitives shared by the slice circuit and pipeline crates.
//!
//! - [`hashes`]: domain-separated BLAKE3 commitments over tensors, traces and
//!   proof transcripts.
//! - [`deterministic`]: seeded ChaCha RNG used for reproducible input
//!   generation and key derivation.
//! - [`ml_dsa`]: ML-DSA-65 signing/verifying keys behind the attestation
//!   proof backend.

pub mod deterministic;
pub mod error;
pub mod hashes;
pub mod ml_dsa;
pub mod traits;

pub use error::CryptoError;
pub use hashes::{Digest32, Transcript};
