//! Deterministic synthetic sliced models.
//!
//! Used by the `synth` CLI command and the test suites to scaffold a model
//! directory (`slices/slice_{n}/`) with compiled circuits and paired keys,
//! without going through an external model compiler.

use std::path::{Path, PathBuf};

use slice_crypto::deterministic::DeterministicRng;
use tracing::info;

use crate::bundle::{SliceBundle, SliceId};
use crate::circuit::{CompiledCircuit, Layer};
use crate::error::SliceCircuitError;
use crate::keys::setup;
use crate::settings::{CircuitSettings, InputType};

/// Directory under a model root that holds the slice bundles.
pub const SLICES_DIR: &str = "slices";

#[derive(Clone, Debug)]
pub struct SyntheticModel {
    pub slices: u32,
    /// Width of every tensor passed between slices (`[1, width]`).
    pub width: usize,
    pub hidden: usize,
    pub scale: u32,
    pub param_scale: u32,
    /// Input shape of the first slice; `[1, width]` when unset.
    pub input_shape: Option<Vec<usize>>,
    pub seed: Vec<u8>,
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self {
            slices: 5,
            width: 8,
            hidden: 16,
            scale: 8,
            param_scale: 6,
            input_shape: None,
            seed: b"synthetic-model".to_vec(),
        }
    }
}

impl SyntheticModel {
    pub fn bundles(&self) -> Result<Vec<SliceBundle>, SliceCircuitError> {
        let link_shape = vec![1, self.width];
        (0..self.slices)
            .map(|index| {
                let input_shape = match (index, &self.input_shape) {
                    (0, Some(shape)) => shape.clone(),
                    _ => link_shape.clone(),
                };
                self.slice(index, input_shape, link_shape.clone())
            })
            .collect()
    }

    /// Write every bundle to `<model_root>/slices/slice_{n}/`.
    pub fn write(&self, model_root: &Path) -> Result<Vec<PathBuf>, SliceCircuitError> {
        let slices_dir = model_root.join(SLICES_DIR);
        let mut written = Vec::new();
        for bundle in self.bundles()? {
            let dir = slices_dir.join(bundle.id().to_string());
            written.push(bundle.write(&dir)?);
        }
        info!(
            model_root = %model_root.display(),
            slices = written.len(),
            "synthetic model written"
        );
        Ok(written)
    }

    fn slice(
        &self,
        index: u32,
        input_shape: Vec<usize>,
        output_shape: Vec<usize>,
    ) -> Result<SliceBundle, SliceCircuitError> {
        let settings = CircuitSettings {
            slice_index: index,
            input_shape,
            output_shape,
            input_scale: self.scale,
            output_scale: self.scale,
            param_scale: self.param_scale,
            input_type: InputType::F64,
        };
        settings.validate().map_err(|err| {
            SliceCircuitError::InvalidCircuit(format!("synthetic {}: {err}", SliceId(index)))
        })?;
        if self.hidden == 0 {
            return Err(SliceCircuitError::InvalidCircuit(format!(
                "synthetic {}: hidden width must be non-zero",
                SliceId(index)
            )));
        }
        let mut rng = DeterministicRng::with_domain(
            format!("synthetic/{}", SliceId(index)).as_bytes(),
            &self.seed,
        );
        let in_dim = settings.input_len();
        let out_dim = settings.output_len();
        let circuit = CompiledCircuit::new(vec![
            self.dense(&mut rng, in_dim, self.hidden)?,
            Layer::Rescale {
                shift: self.param_scale,
            },
            Layer::Relu,
            self.dense(&mut rng, self.hidden, out_dim)?,
            Layer::Rescale {
                shift: self.param_scale,
            },
        ]);
        let (proving_key, verifying_key) = setup(&settings, &circuit, &self.seed)?;
        SliceBundle::from_parts(settings, circuit, proving_key, verifying_key).map_err(|reason| {
            SliceCircuitError::InvalidBundle {
                path: PathBuf::from(SliceId(index).to_string()),
                reason,
            }
        })
    }

    fn dense(
        &self,
        rng: &mut DeterministicRng,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Layer, SliceCircuitError> {
        let bounds = 1u64.checked_shl(self.param_scale).and_then(|one| {
            let bias = 1u64.checked_shl(self.scale.checked_add(self.param_scale)?)? / 4;
            let weight = (2 * one).checked_div(u64::try_from(in_dim).ok()?)?;
            Some((weight.max(1), bias))
        });
        let (weight_bound, bias_bound) = bounds.ok_or_else(|| {
            SliceCircuitError::InvalidCircuit(format!(
                "synthetic dense {in_dim}x{out_dim} at scale {} and param_scale {} is out of range",
                self.scale, self.param_scale
            ))
        })?;
        Ok(Layer::Dense {
            in_dim,
            out_dim,
            weights: (0..in_dim * out_dim)
                .map(|_| rng.signed(weight_bound))
                .collect(),
            bias: (0..out_dim).map(|_| rng.signed(bias_bound)).collect(),
        })
    }
}
