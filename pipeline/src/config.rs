use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slice_circuit::synthetic::SLICES_DIR;
use slice_circuit::SliceId;

use crate::error::{PipelineError, PipelineResult};
use crate::fsutil::read_json;
use crate::orchestrator::PipelineOptions;
use crate::prover::ProverConfig;

/// Run root used when only a model root is configured.
pub const DEFAULT_RUN_DIR: &str = "run";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Absolute path to one slice bundle directory.
    pub slice_path: Option<PathBuf>,
    /// Absolute directory under which `run_*` folders are created.
    pub run_root: Option<PathBuf>,
    /// Absolute model directory holding `<slices_dir>/slice_{n}/`.
    pub model_root: Option<PathBuf>,
    pub slices_dir: String,
    /// Proving limit in seconds; `None` waits indefinitely.
    pub proof_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slice_path: None,
            run_root: None,
            model_root: None,
            slices_dir: SLICES_DIR.to_string(),
            proof_timeout_secs: Some(300),
        }
    }
}

/// Paths a single-slice handler runs with. Only built through
/// [`HandlerConfig::new`] or [`PipelineConfig::resolve_handler`], so both paths
/// are always absolute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerConfig {
    slice_path: PathBuf,
    run_root: PathBuf,
    prover: ProverConfig,
}

impl HandlerConfig {
    pub fn new(
        slice_path: impl AsRef<Path>,
        run_root: impl AsRef<Path>,
        prover: ProverConfig,
    ) -> PipelineResult<Self> {
        Ok(Self {
            slice_path: absolute("slice_path", slice_path.as_ref())?,
            run_root: absolute("run_root", run_root.as_ref())?,
            prover,
        })
    }

    pub fn slice_path(&self) -> &Path {
        &self.slice_path
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn prover(&self) -> ProverConfig {
        self.prover
    }
}

/// Paths a full chain runs with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    pub model_root: PathBuf,
    pub run_root: PathBuf,
    pub options: PipelineOptions,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        read_json(path)
    }

    pub fn prover(&self) -> ProverConfig {
        ProverConfig {
            max_proving_time: self.proof_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Resolve the slice bundle and run root for a single-slice handler.
    ///
    /// With only `model_root` set, the run root is `<model_root>/run` and the
    /// slice is the only bundle under `<model_root>/<slices_dir>`.
    pub fn resolve_handler(&self) -> PipelineResult<HandlerConfig> {
        let model_root = self.model_root()?;
        let run_root = self.run_root(model_root.as_deref())?;
        let slice_path = match &self.slice_path {
            Some(path) => absolute("slice_path", path)?,
            None => match &model_root {
                Some(root) => self.single_bundle(root)?,
                None => {
                    return Err(PipelineError::Configuration(
                        "set slice_path, or model_root holding a single slice bundle".into(),
                    ))
                }
            },
        };
        HandlerConfig::new(slice_path, run_root, self.prover())
    }

    pub fn resolve_chain(&self) -> PipelineResult<ChainConfig> {
        let model_root = self
            .model_root()?
            .ok_or_else(|| PipelineError::Configuration("model_root is required".into()))?;
        let run_root = self.run_root(Some(&model_root))?;
        Ok(ChainConfig {
            model_root,
            run_root,
            options: PipelineOptions {
                slices_dir: self.slices_dir.clone(),
                prover: self.prover(),
            },
        })
    }

    fn model_root(&self) -> PipelineResult<Option<PathBuf>> {
        self.model_root
            .as_deref()
            .map(|path| absolute("model_root", path))
            .transpose()
    }

    fn run_root(&self, model_root: Option<&Path>) -> PipelineResult<PathBuf> {
        match (&self.run_root, model_root) {
            (Some(path), _) => absolute("run_root", path),
            (None, Some(root)) => Ok(root.join(DEFAULT_RUN_DIR)),
            (None, None) => Err(PipelineError::Configuration(
                "set run_root, or model_root to default it".into(),
            )),
        }
    }

    fn single_bundle(&self, model_root: &Path) -> PipelineResult<PathBuf> {
        let slices_root = model_root.join(&self.slices_dir);
        let entries = fs::read_dir(&slices_root).map_err(|err| {
            PipelineError::Configuration(format!(
                "cannot read slice bundles under {}: {err}",
                slices_root.display()
            ))
        })?;
        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::io(&slices_root, err))?;
            let is_bundle = entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.parse::<SliceId>().is_ok());
            if is_bundle {
                candidates.push(entry.path());
            }
        }
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(PipelineError::Configuration(format!(
                "no slice bundle under {}",
                slices_root.display()
            ))),
            n => Err(PipelineError::Configuration(format!(
                "{n} slice bundles under {}; set slice_path",
                slices_root.display()
            ))),
        }
    }
}

fn absolute(name: &str, path: &Path) -> PipelineResult<PathBuf> {
    if !path.is_absolute() {
        return Err(PipelineError::Configuration(format!(
            "{name} must be absolute, got {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_or_missing_paths_are_rejected() {
        let config = PipelineConfig {
            slice_path: Some(PathBuf::from("slices/slice_0")),
            run_root: Some(PathBuf::from("/tmp/run")),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.resolve_handler(),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            PipelineConfig::default().resolve_handler(),
            Err(PipelineError::Configuration(_))
        ));
        assert!(matches!(
            PipelineConfig::default().resolve_chain(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn model_root_supplies_fallbacks() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("slices/slice_0")).expect("bundle dir");
        let config = PipelineConfig {
            model_root: Some(root.path().to_path_buf()),
            ..PipelineConfig::default()
        };
        let handler = config.resolve_handler().expect("resolve");
        assert_eq!(handler.run_root(), root.path().join(DEFAULT_RUN_DIR));
        assert_eq!(handler.slice_path(), root.path().join("slices/slice_0"));

        fs::create_dir_all(root.path().join("slices/slice_1")).expect("second bundle");
        assert!(matches!(
            config.resolve_handler(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn config_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.json");
        fs::write(&path, br#"{"model_root": "/models/mnist", "proof_timeout_secs": null}"#)
            .expect("write");
        let config = PipelineConfig::load(&path).expect("load");
        assert_eq!(config.slices_dir, SLICES_DIR);
        assert_eq!(config.prover().max_proving_time, None);
        let chain = config.resolve_chain().expect("chain");
        assert_eq!(chain.run_root, PathBuf::from("/models/mnist/run"));
    }

    #[test]
    fn handler_config_rejects_relative_paths() {
        let prover = ProverConfig::default();
        for (slice_path, run_root) in [
            ("slices/slice_0", "/runs"),
            ("/models/slices/slice_0", "runs"),
            ("", "/runs"),
        ] {
            assert!(matches!(
                HandlerConfig::new(slice_path, run_root, prover),
                Err(PipelineError::Configuration(_))
            ));
        }
        let config =
            HandlerConfig::new("/models/slices/slice_0", "/runs", prover).expect("absolute");
        assert_eq!(config.run_root(), Path::new("/runs"));
    }
}
