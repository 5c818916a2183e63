//! Compiled slice circuits.
//!
//! A circuit is an ordered list of integer layers over a flattened activation
//! vector. Every layer is deterministic integer arithmetic, so executing the
//! same quantized input always produces the same activations.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slice_crypto::hashes::CIRCUIT_DOMAIN;
use slice_crypto::{Digest32, Transcript};

use crate::constants::{CIRCUIT_FORMAT_VERSION, MAX_RESCALE_SHIFT};
use crate::error::SliceCircuitError;
use crate::settings::CircuitSettings;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    /// `y_j = sum_i w[j * in_dim + i] * x_i + b_j`. Weights are at `param_scale`,
    /// the bias at input scale plus `param_scale`.
    Dense {
        in_dim: usize,
        out_dim: usize,
        weights: Vec<i64>,
        bias: Vec<i64>,
    },
    Relu,
    /// Rounding arithmetic right shift.
    Rescale { shift: u32 },
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Dense { .. } => "dense",
            Layer::Relu => "relu",
            Layer::Rescale { .. } => "rescale",
        }
    }

    pub fn apply(&self, input: &[i64], index: usize) -> Result<Vec<i64>, SliceCircuitError> {
        match self {
            Layer::Dense {
                in_dim,
                out_dim,
                weights,
                bias,
            } => {
                if *in_dim == 0 || input.len() != *in_dim {
                    return Err(SliceCircuitError::InvalidCircuit(format!(
                        "layer {index} expects width {in_dim}, got {}",
                        input.len()
                    )));
                }
                let mut out = Vec::with_capacity(*out_dim);
                for (row, b) in weights.chunks_exact(*in_dim).zip(bias) {
                    let value = row
                        .iter()
                        .zip(input)
                        .try_fold(i128::from(*b), |acc, (w, x)| {
                            i128::from(*w)
                                .checked_mul(i128::from(*x))
                                .and_then(|term| acc.checked_add(term))
                        })
                        .and_then(|acc| i64::try_from(acc).ok())
                        .ok_or(SliceCircuitError::ArithmeticOverflow { layer: index })?;
                    out.push(value);
                }
                Ok(out)
            }
            Layer::Relu => Ok(input.iter().map(|x| (*x).max(0)).collect()),
            Layer::Rescale { shift } => {
                if *shift == 0 {
                    return Ok(input.to_vec());
                }
                let half = 1i64 << (shift - 1);
                input
                    .iter()
                    .map(|x| {
                        x.checked_add(half)
                            .map(|v| v >> shift)
                            .ok_or(SliceCircuitError::ArithmeticOverflow { layer: index })
                    })
                    .collect()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCircuit {
    pub version: u32,
    pub layers: Vec<Layer>,
}

impl CompiledCircuit {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            version: CIRCUIT_FORMAT_VERSION,
            layers,
        }
    }

    pub fn load(path: &Path) -> Result<Self, SliceCircuitError> {
        let bytes = fs::read(path).map_err(|err| SliceCircuitError::io(path, err))?;
        let circuit: Self = bincode::deserialize(&bytes)?;
        if circuit.version != CIRCUIT_FORMAT_VERSION {
            return Err(SliceCircuitError::InvalidCircuit(format!(
                "unsupported circuit format version {}",
                circuit.version
            )));
        }
        Ok(circuit)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SliceCircuitError> {
        Ok(bincode::serialize(self)?)
    }

    /// Check dimension flow and scale bookkeeping against `settings`.
    pub fn validate(&self, settings: &CircuitSettings) -> Result<(), SliceCircuitError> {
        settings.validate()?;
        if self.layers.is_empty() {
            return Err(SliceCircuitError::InvalidCircuit("circuit has no layers".into()));
        }
        let mut width = settings.input_len();
        let mut scale = i64::from(settings.input_scale);
        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                Layer::Dense {
                    in_dim,
                    out_dim,
                    weights,
                    bias,
                } => {
                    if *in_dim != width {
                        return Err(SliceCircuitError::InvalidCircuit(format!(
                            "layer {index} expects width {in_dim}, previous layer yields {width}"
                        )));
                    }
                    if *in_dim == 0 || *out_dim == 0 {
                        return Err(SliceCircuitError::InvalidCircuit(format!(
                            "layer {index} has an empty dimension"
                        )));
                    }
                    if weights.len() != in_dim * out_dim || bias.len() != *out_dim {
                        return Err(SliceCircuitError::InvalidCircuit(format!(
                            "layer {index} parameter lengths do not match {out_dim}x{in_dim}"
                        )));
                    }
                    width = *out_dim;
                    scale += i64::from(settings.param_scale);
                }
                Layer::Relu => {}
                Layer::Rescale { shift } => {
                    if *shift > MAX_RESCALE_SHIFT {
                        return Err(SliceCircuitError::InvalidCircuit(format!(
                            "layer {index} shift {shift} exceeds {MAX_RESCALE_SHIFT}"
                        )));
                    }
                    scale -= i64::from(*shift);
                }
            }
        }
        if width != settings.output_len() {
            return Err(SliceCircuitError::InvalidCircuit(format!(
                "final width {width} does not match output shape {:?}",
                settings.output_shape
            )));
        }
        if scale != i64::from(settings.output_scale) {
            return Err(SliceCircuitError::InvalidCircuit(format!(
                "final scale {scale} does not match output scale {}",
                settings.output_scale
            )));
        }
        Ok(())
    }

    /// Digest binding the settings and every layer parameter.
    pub fn digest(&self, settings: &CircuitSettings) -> Result<Digest32, SliceCircuitError> {
        let settings_bytes = bincode::serialize(settings)?;
        let circuit_bytes = self.to_bytes()?;
        let mut transcript = Transcript::new(CIRCUIT_DOMAIN);
        transcript
            .absorb_bytes(&settings_bytes)
            .absorb_bytes(&circuit_bytes);
        Ok(transcript.finalize())
    }

    /// Run every layer, returning the activation vector after each one.
    pub fn execute(&self, input: &[i64]) -> Result<Vec<Vec<i64>>, SliceCircuitError> {
        let mut activations: Vec<Vec<i64>> = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate() {
            let previous = activations.last().map_or(input, Vec::as_slice);
            let next = layer.apply(previous, index)?;
            activations.push(next);
        }
        Ok(activations)
    }
}
