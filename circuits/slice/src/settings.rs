use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_SCALE;
use crate::error::SliceCircuitError;
use crate::tensor::Tensor;

/// Numeric domain the slice accepts on its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Values are narrowed to single precision before quantization.
    F32,
    #[default]
    F64,
    /// Values must be integral.
    Int,
}

/// Shape and fixed-point parameters of one compiled slice (`settings.json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSettings {
    pub slice_index: u32,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub input_scale: u32,
    pub output_scale: u32,
    pub param_scale: u32,
    #[serde(default)]
    pub input_type: InputType,
}

impl CircuitSettings {
    pub fn load(path: &Path) -> Result<Self, SliceCircuitError> {
        let bytes = fs::read(path).map_err(|err| SliceCircuitError::io(path, err))?;
        let settings: Self = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SliceCircuitError> {
        for (name, scale) in [
            ("input_scale", self.input_scale),
            ("output_scale", self.output_scale),
            ("param_scale", self.param_scale),
        ] {
            if scale > MAX_SCALE {
                return Err(SliceCircuitError::InvalidSettings(format!(
                    "{name} {scale} exceeds {MAX_SCALE}"
                )));
            }
        }
        if self.input_len() == 0 {
            return Err(SliceCircuitError::InvalidSettings(
                "input shape has no elements".into(),
            ));
        }
        if self.output_len() == 0 {
            return Err(SliceCircuitError::InvalidSettings(
                "output shape has no elements".into(),
            ));
        }
        Ok(())
    }

    pub fn input_len(&self) -> usize {
        self.input_shape.iter().product()
    }

    pub fn output_len(&self) -> usize {
        self.output_shape.iter().product()
    }

    /// Bring `input` to `input_shape`.
    ///
    /// A tensor already in `input_shape` is returned as is. A flat tensor whose
    /// length equals the element count of `input_shape` is reshaped. Anything
    /// else is a shape mismatch.
    pub fn conform_input(&self, input: Tensor) -> Result<Tensor, SliceCircuitError> {
        if input.shape() == self.input_shape.as_slice() {
            return Ok(input);
        }
        if input.shape().len() == 1 && input.len() == self.input_len() {
            return input.reshape(self.input_shape.clone());
        }
        Err(SliceCircuitError::ShapeMismatch {
            expected: self.input_shape.clone(),
            actual: input.shape().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CircuitSettings {
        CircuitSettings {
            slice_index: 0,
            input_shape: vec![1, 2, 2],
            output_shape: vec![1, 3],
            input_scale: 8,
            output_scale: 8,
            param_scale: 6,
            input_type: InputType::F64,
        }
    }

    #[test]
    fn flat_input_is_reshaped() {
        let flat = Tensor::new(vec![4], vec![0.0, 0.25, 0.5, 0.75]).expect("tensor");
        let conformed = settings().conform_input(flat).expect("conform");
        assert_eq!(conformed.shape(), &[1, 2, 2]);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let wrong = Tensor::new(vec![2, 2], vec![0.0; 4]).expect("tensor");
        assert!(matches!(
            settings().conform_input(wrong),
            Err(SliceCircuitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn oversized_scale_is_rejected() {
        let mut bad = settings();
        bad.param_scale = MAX_SCALE + 1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn input_type_defaults_and_parses() {
        let json = r#"{"slice_index":3,"input_shape":[1,4],"output_shape":[1,2],
            "input_scale":7,"output_scale":7,"param_scale":7}"#;
        let parsed: CircuitSettings = serde_json::from_str(json).expect("settings json");
        assert_eq!(parsed.input_type, InputType::F64);

        let typed: InputType = serde_json::from_str("\"int\"").expect("input type");
        assert_eq!(typed, InputType::Int);
    }
}
