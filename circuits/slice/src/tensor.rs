//! Dense `f64` tensors exchanged between slices.
//!
//! Tensors travel as nested JSON arrays (`input.json`, `output.json`) and are
//! committed with a domain-separated BLAKE3 transcript over rank, dimensions
//! and canonical value bits.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use slice_crypto::hashes::TENSOR_DOMAIN;
use slice_crypto::{Digest32, Transcript};

use crate::constants::MAX_FIXED_MAGNITUDE;
use crate::error::SliceCircuitError;
use crate::settings::InputType;

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, SliceCircuitError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SliceCircuitError::MalformedTensor(format!(
                "shape {shape:?} holds {expected} values, got {}",
                data.len()
            )));
        }
        if let Some(index) = data.iter().position(|value| !value.is_finite()) {
            return Err(SliceCircuitError::MalformedTensor(format!(
                "non-finite value at index {index}"
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, SliceCircuitError> {
        Self::new(shape, self.data)
    }

    /// Parse a nested JSON array. Ragged nesting and non-numeric leaves are rejected.
    pub fn from_json(value: &Value) -> Result<Self, SliceCircuitError> {
        let mut shape = Vec::new();
        let mut data = Vec::new();
        let mut leaf_depth = None;
        flatten(value, 0, &mut shape, &mut leaf_depth, &mut data)?;
        Self::new(shape, data)
    }

    pub fn to_json(&self) -> Value {
        nest(&self.shape, &self.data)
    }

    /// Commitment over rank, dimensions and values; `-0.0` commits as `0.0`.
    pub fn commitment(&self) -> Digest32 {
        let mut transcript = Transcript::new(TENSOR_DOMAIN);
        transcript.absorb_u64(self.shape.len() as u64);
        for dim in &self.shape {
            transcript.absorb_u64(*dim as u64);
        }
        transcript.absorb_u64(self.data.len() as u64);
        for value in &self.data {
            let canonical = if *value == 0.0 { 0.0f64 } else { *value };
            transcript.absorb_u64(canonical.to_bits());
        }
        transcript.finalize()
    }

    /// Map every value onto the fixed-point grid `round(x * 2^scale)`.
    pub fn quantize(&self, scale: u32, input_type: InputType) -> Result<Vec<i64>, SliceCircuitError> {
        let factor = pow2(scale);
        self.data
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                let value = match input_type {
                    InputType::F64 => value,
                    InputType::F32 => f64::from(value as f32),
                    InputType::Int => {
                        if value.fract() != 0.0 {
                            return Err(SliceCircuitError::InputType {
                                index,
                                value,
                                input_type,
                            });
                        }
                        value
                    }
                };
                let scaled = (value * factor).round();
                if !scaled.is_finite() || scaled.abs() >= MAX_FIXED_MAGNITUDE {
                    return Err(SliceCircuitError::QuantizationOverflow { index, scale });
                }
                Ok(scaled as i64)
            })
            .collect()
    }

    /// Inverse of [`Tensor::quantize`] for values produced by the circuit.
    pub fn dequantize(
        shape: Vec<usize>,
        values: &[i64],
        scale: u32,
    ) -> Result<Self, SliceCircuitError> {
        let factor = pow2(scale);
        let data = values.iter().map(|&q| q as f64 / factor).collect();
        Self::new(shape, data)
    }
}

fn pow2(scale: u32) -> f64 {
    2f64.powi(scale as i32)
}

fn flatten(
    value: &Value,
    depth: usize,
    shape: &mut Vec<usize>,
    leaf_depth: &mut Option<usize>,
    data: &mut Vec<f64>,
) -> Result<(), SliceCircuitError> {
    match value {
        Value::Array(items) => {
            if leaf_depth.is_some_and(|leaf| depth >= leaf) {
                return Err(ragged(depth));
            }
            if shape.len() == depth {
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return Err(ragged(depth));
            }
            for item in items {
                flatten(item, depth + 1, shape, leaf_depth, data)?;
            }
            Ok(())
        }
        Value::Number(number) => {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(leaf) if leaf != depth => return Err(ragged(depth)),
                Some(_) => {}
            }
            if shape.len() != depth {
                return Err(ragged(depth));
            }
            let value = number.as_f64().ok_or_else(|| {
                SliceCircuitError::MalformedTensor(format!("number {number} is not representable"))
            })?;
            data.push(value);
            Ok(())
        }
        other => Err(SliceCircuitError::MalformedTensor(format!(
            "expected number or array at depth {depth}, found {}",
            json_kind(other)
        ))),
    }
}

fn ragged(depth: usize) -> SliceCircuitError {
    SliceCircuitError::MalformedTensor(format!("ragged nesting at depth {depth}"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn nest(shape: &[usize], data: &[f64]) -> Value {
    match shape.split_first() {
        None => data
            .first()
            .and_then(|value| Number::from_f64(*value))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some((&outer, rest)) => {
            let chunk: usize = rest.iter().product();
            Value::Array(
                (0..outer)
                    .map(|i| nest(rest, &data[i * chunk..(i + 1) * chunk]))
                    .collect(),
            )
        }
    }
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Tensor::from_json(&value).map_err(serde::de::Error::custom)
    }
}
