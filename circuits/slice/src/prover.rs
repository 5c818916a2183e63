use std::sync::atomic::{AtomicBool, Ordering};

use slice_crypto::traits::{Signature, SigningKey};
use tracing::debug;

use crate::bundle::SliceBundle;
use crate::constants::PROOF_LEN;
use crate::error::SliceCircuitError;
use crate::proof::{proof_transcript, SliceProof};
use crate::public_inputs::PublicInstances;
use crate::tensor::Tensor;
use crate::witness::SliceTrace;

pub fn gen_proof(bundle: &SliceBundle, trace: &SliceTrace) -> Result<SliceProof, SliceCircuitError> {
    gen_proof_cancellable(bundle, trace, &AtomicBool::new(false))
}

/// Prove `trace` against the bundle's circuit.
///
/// Every layer transition of the trace is re-checked before anything is
/// signed; `cancel` is polled between layers.
pub fn gen_proof_cancellable(
    bundle: &SliceBundle,
    trace: &SliceTrace,
    cancel: &AtomicBool,
) -> Result<SliceProof, SliceCircuitError> {
    let proving_key = bundle.proving_key();
    if proving_key.circuit_digest() != trace.circuit_digest {
        return Err(SliceCircuitError::KeyMismatch {
            key: proving_key.circuit_digest(),
            circuit: trace.circuit_digest,
        });
    }
    if trace.circuit_digest != bundle.circuit_digest() {
        return Err(SliceCircuitError::MalformedTrace(format!(
            "trace bound to circuit {}, bundle circuit is {}",
            trace.circuit_digest,
            bundle.circuit_digest()
        )));
    }

    let output = check_constraints(bundle, trace, cancel)?;
    let instances = PublicInstances {
        input_commitment: trace.input.commitment(),
        output_commitment: output.commitment(),
        circuit_digest: bundle.circuit_digest(),
    };

    let trace_commitment = trace.commitment();
    let message = proof_transcript(&bundle.circuit_digest(), &instances, &trace_commitment);
    let signature = proving_key.signing_key().sign(message.as_bytes());

    let mut bytes = Vec::with_capacity(PROOF_LEN);
    bytes.extend_from_slice(trace_commitment.as_bytes());
    bytes.extend_from_slice(signature.as_bytes());
    debug_assert_eq!(bytes.len(), PROOF_LEN);

    debug!(slice = %bundle.id(), proof_len = bytes.len(), "slice proof generated");
    Ok(SliceProof { bytes, instances })
}

/// Re-derive every activation and compare it with the trace. Returns the
/// dequantized output on success.
fn check_constraints(
    bundle: &SliceBundle,
    trace: &SliceTrace,
    cancel: &AtomicBool,
) -> Result<Tensor, SliceCircuitError> {
    let settings = bundle.settings();
    let layers = &bundle.circuit().layers;

    if trace.input.shape() != settings.input_shape.as_slice() {
        return Err(SliceCircuitError::MalformedTrace(format!(
            "input shape {:?} does not match {:?}",
            trace.input.shape(),
            settings.input_shape
        )));
    }
    let quantized = trace
        .input
        .quantize(settings.input_scale, settings.input_type)?;
    if quantized != trace.quantized_input {
        return Err(SliceCircuitError::MalformedTrace(
            "quantized input does not match the input tensor".into(),
        ));
    }
    if trace.activations.len() != layers.len() {
        return Err(SliceCircuitError::MalformedTrace(format!(
            "trace has {} activations for {} layers",
            trace.activations.len(),
            layers.len()
        )));
    }

    let mut previous = trace.quantized_input.as_slice();
    for (index, (layer, recorded)) in layers.iter().zip(&trace.activations).enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(SliceCircuitError::Cancelled);
        }
        let expected = layer.apply(previous, index)?;
        if &expected != recorded {
            return Err(SliceCircuitError::MalformedTrace(format!(
                "layer {index} ({}) does not follow from its input",
                layer.name()
            )));
        }
        previous = recorded.as_slice();
    }

    Tensor::dequantize(settings.output_shape.clone(), previous, settings.output_scale)
}
