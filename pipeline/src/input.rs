use std::path::Path;

use serde::{Deserialize, Serialize};
use slice_circuit::{CircuitSettings, InputType, Tensor};
use slice_crypto::deterministic::DeterministicRng;

use crate::error::{PipelineError, PipelineResult};
use crate::fsutil::{read_json, write_json_atomic};

pub const INPUT_FILE: &str = "input.json";
pub const OUTPUT_FILE: &str = "output.json";
pub const PROOF_FILE: &str = "proof.json";

/// Where a slice's input comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum InputContext {
    /// A caller-supplied tensor, used verbatim.
    Sample(Tensor),
    /// Seed material expanded into values on the input fixed-point grid.
    Seed(Vec<u8>),
    /// The previous slice's `output.json` in the same run.
    PreviousOutput,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub input_data: Tensor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputFile {
    pub output_data: Tensor,
}

/// Deterministic input for `settings`.
///
/// Float inputs land on the `input_scale` grid in `[0, 1)`, integer inputs
/// in `0..10`. The same seed always yields the same tensor.
pub fn seeded_input(settings: &CircuitSettings, seed: &[u8]) -> PipelineResult<Tensor> {
    let mut rng = DeterministicRng::with_domain(b"slice-input", seed);
    let len = settings.input_len();
    let data = match settings.input_type {
        InputType::Int => (0..len).map(|_| rng.below(10) as f64).collect(),
        InputType::F32 | InputType::F64 => {
            let steps = 1u64 << settings.input_scale;
            (0..len)
                .map(|_| rng.below(steps) as f64 / steps as f64)
                .collect()
        }
    };
    Tensor::new(settings.input_shape.clone(), data)
        .map_err(|err| PipelineError::Configuration(err.to_string()))
}

pub fn write_input(slice_dir: &Path, input: &Tensor) -> PipelineResult<()> {
    write_json_atomic(
        &slice_dir.join(INPUT_FILE),
        &InputFile {
            input_data: input.clone(),
        },
    )
}

pub fn read_input(slice_dir: &Path) -> PipelineResult<Tensor> {
    let file: InputFile = read_json(&slice_dir.join(INPUT_FILE))?;
    Ok(file.input_data)
}

pub fn write_output(slice_dir: &Path, output: &Tensor) -> PipelineResult<()> {
    write_json_atomic(
        &slice_dir.join(OUTPUT_FILE),
        &OutputFile {
            output_data: output.clone(),
        },
    )
}

pub fn read_output(slice_dir: &Path) -> PipelineResult<Tensor> {
    let file: OutputFile = read_json(&slice_dir.join(OUTPUT_FILE))?;
    Ok(file.output_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CircuitSettings {
        CircuitSettings {
            slice_index: 0,
            input_shape: vec![1, 2, 3],
            output_shape: vec![1, 1],
            input_scale: 4,
            output_scale: 4,
            param_scale: 2,
            input_type: InputType::F64,
        }
    }

    #[test]
    fn seeded_input_is_deterministic_and_on_grid() {
        let a = seeded_input(&settings(), b"seed").expect("input");
        let b = seeded_input(&settings(), b"seed").expect("input");
        let c = seeded_input(&settings(), b"other").expect("input");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.shape(), &[1, 2, 3]);
        for value in a.data() {
            assert!((0.0..1.0).contains(value));
            assert_eq!((value * 16.0).fract(), 0.0);
        }
    }

    #[test]
    fn input_file_roundtrip_is_byte_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = seeded_input(&settings(), b"seed").expect("input");
        write_input(dir.path(), &input).expect("write");
        let first = std::fs::read(dir.path().join(INPUT_FILE)).expect("read");
        let back = read_input(dir.path()).expect("parse");
        assert_eq!(back, input);
        write_input(dir.path(), &back).expect("rewrite");
        let second = std::fs::read(dir.path().join(INPUT_FILE)).expect("read");
        assert_eq!(first, second);
    }
}
