use slice_crypto::hashes::TRACE_DOMAIN;
use slice_crypto::{Digest32, Transcript};

use crate::bundle::SliceBundle;
use crate::error::SliceCircuitError;
use crate::tensor::Tensor;

/// Private execution trace of one slice.
///
/// Holds the quantized input and every intermediate activation. It stays in
/// memory; the run directory only ever sees the input and output tensors.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceTrace {
    pub circuit_digest: Digest32,
    pub input: Tensor,
    pub quantized_input: Vec<i64>,
    pub activations: Vec<Vec<i64>>,
}

impl SliceTrace {
    pub fn output(&self) -> &[i64] {
        self.activations
            .last()
            .map_or(self.quantized_input.as_slice(), Vec::as_slice)
    }

    pub fn commitment(&self) -> Digest32 {
        let mut transcript = Transcript::new(TRACE_DOMAIN);
        transcript
            .absorb_digest(&self.circuit_digest)
            .absorb_i64s(&self.quantized_input)
            .absorb_u64(self.activations.len() as u64);
        for layer in &self.activations {
            transcript.absorb_i64s(layer);
        }
        transcript.finalize()
    }
}

/// Result of executing a slice on one input.
#[derive(Clone, Debug, PartialEq)]
pub struct Witness {
    pub trace: SliceTrace,
    pub output: Tensor,
    pub input_commitment: Digest32,
    pub output_commitment: Digest32,
}

/// Execute the bundle's circuit on `input`.
///
/// The input is brought to the circuit's input shape first (a flat list of
/// the right length is reshaped). Shape, type and overflow problems surface as
/// errors before anything is proven.
pub fn generate_witness(bundle: &SliceBundle, input: Tensor) -> Result<Witness, SliceCircuitError> {
    let settings = bundle.settings();
    let input = settings.conform_input(input)?;
    let quantized_input = input.quantize(settings.input_scale, settings.input_type)?;
    let activations = bundle.circuit().execute(&quantized_input)?;

    let trace = SliceTrace {
        circuit_digest: bundle.circuit_digest(),
        input,
        quantized_input,
        activations,
    };
    let output = Tensor::dequantize(
        settings.output_shape.clone(),
        trace.output(),
        settings.output_scale,
    )?;
    let input_commitment = trace.input.commitment();
    let output_commitment = output.commitment();
    Ok(Witness {
        trace,
        output,
        input_commitment,
        output_commitment,
    })
}
