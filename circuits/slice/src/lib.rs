//! Slice circuits for sliced inference proofs.
//!
//! Each slice of a model ships as a bundle: settings, a compiled integer
//! circuit and a paired proving/verifying key. This crate loads bundles,
//! executes them into private traces, proves traces and verifies proofs from
//! the verifying key and public instances alone.

pub mod bundle;
pub mod circuit;
pub mod constants;
pub mod error;
pub mod keys;
pub mod proof;
pub mod prover;
pub mod public_inputs;
pub mod settings;
pub mod synthetic;
pub mod tensor;
pub mod verifier;
pub mod witness;

pub use bundle::{SliceBundle, SliceId};
pub use circuit::{CompiledCircuit, Layer};
pub use error::{SliceCircuitError, SliceVerifyError};
pub use keys::{setup, ProvingKey, VerifyingKey};
pub use proof::{ProofFile, SliceProof};
pub use prover::{gen_proof, gen_proof_cancellable};
pub use public_inputs::PublicInstances;
pub use settings::{CircuitSettings, InputType};
pub use tensor::Tensor;
pub use verifier::{bind_input, verify, verify_file};
pub use witness::{generate_witness, SliceTrace, Witness};
