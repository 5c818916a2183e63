use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

/// Deterministic RNG seeded via SHA-256 over a domain separated label.
#[derive(Clone)]
pub struct DeterministicRng {
    inner: ChaCha20Rng,
}

impl DeterministicRng {
    /// Create a deterministic RNG from arbitrary seed material.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::with_domain(b"slice-drg", seed)
    }

    /// Create a deterministic RNG whose stream is bound to `domain` as well as `seed`.
    pub fn with_domain(domain: &[u8], seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((domain.len() as u64).to_le_bytes());
        hasher.update(domain);
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut seed_bytes = [0u8; 32];
        seed_bytes.copy_from_slice(&digest);
        let inner = ChaCha20Rng::from_seed(seed_bytes);
        Self { inner }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Uniform value in `[0, bound)`. `bound` must be non-zero.
    pub fn below(&mut self, bound: u64) -> u64 {
        // Rejection sampling keeps the distribution exact.
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let value = self.next_u64();
            if value < zone {
                return value % bound;
            }
        }
    }

    /// Signed value in `[-magnitude, magnitude]`.
    pub fn signed(&mut self, magnitude: u64) -> i64 {
        let span = magnitude.saturating_mul(2).saturating_add(1);
        self.below(span) as i64 - magnitude as i64
    }
}
