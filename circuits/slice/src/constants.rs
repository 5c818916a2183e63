use slice_crypto::ml_dsa::ML_DSA_SIGNATURE_LEN;

/// Name recorded in `metadata.json` for proofs produced by this crate.
pub const PROOF_SYSTEM: &str = "ml-dsa-65/attested-trace";

/// Version tag of the compiled circuit encoding (`model.compiled`).
pub const CIRCUIT_FORMAT_VERSION: u32 = 1;

/// Version tag of the bincode key files (`pk.key`, `vk.key`).
pub const KEY_FORMAT_VERSION: u32 = 1;

/// Largest fixed-point exponent accepted for any scale.
pub const MAX_SCALE: u32 = 32;

/// Largest shift a `Rescale` layer may apply.
pub const MAX_RESCALE_SHIFT: u32 = 62;

/// Quantized magnitudes stay below 2^52 so that dequantized values are exact in `f64`.
pub const MAX_FIXED_MAGNITUDE: f64 = 4_503_599_627_370_496.0;

/// Length of the trace commitment prefix in proof bytes.
pub const TRACE_COMMITMENT_LEN: usize = 32;

/// Total proof length: trace commitment followed by the ML-DSA-65 signature.
pub const PROOF_LEN: usize = TRACE_COMMITMENT_LEN + ML_DSA_SIGNATURE_LEN;

/// Number of public instances attached to every slice proof.
pub const INSTANCE_COUNT: usize = 3;

pub const SETTINGS_FILE: &str = "settings.json";
pub const COMPILED_CIRCUIT_FILE: &str = "model.compiled";
pub const PROVING_KEY_FILE: &str = "pk.key";
pub const VERIFYING_KEY_FILE: &str = "vk.key";

/// Directory prefix of a slice bundle (`slice_{n}`).
pub const SLICE_DIR_PREFIX: &str = "slice_";
