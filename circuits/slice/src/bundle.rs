//! Slice artifact bundles.
//!
//! A bundle directory `slice_{n}/` holds the settings, compiled circuit and
//! the paired keys for one slice. Loading checks that all four belong
//! together; a loaded bundle is immutable and shared read-only.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use slice_crypto::Digest32;
use tracing::debug;

use crate::circuit::CompiledCircuit;
use crate::constants::{
    COMPILED_CIRCUIT_FILE, PROVING_KEY_FILE, SETTINGS_FILE, SLICE_DIR_PREFIX, VERIFYING_KEY_FILE,
};
use crate::error::SliceCircuitError;
use crate::keys::{ProvingKey, VerifyingKey};
use crate::settings::CircuitSettings;

/// Index of a slice, rendered as `slice_{n}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SliceId(pub u32);

impl SliceId {
    pub fn index(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SLICE_DIR_PREFIX}{}", self.0)
    }
}

impl FromStr for SliceId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value
            .strip_prefix(SLICE_DIR_PREFIX)
            .ok_or_else(|| format!("{value:?} is not a slice id"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{value:?} is not a slice id"));
        }
        digits
            .parse()
            .map(Self)
            .map_err(|err| format!("{value:?}: {err}"))
    }
}

impl From<SliceId> for String {
    fn from(id: SliceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SliceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Debug)]
pub struct SliceBundle {
    id: SliceId,
    settings: CircuitSettings,
    circuit: CompiledCircuit,
    proving_key: ProvingKey,
    verifying_key: VerifyingKey,
    circuit_digest: Digest32,
}

impl SliceBundle {
    /// Assemble a bundle from its parts, checking that they belong together.
    pub fn from_parts(
        settings: CircuitSettings,
        circuit: CompiledCircuit,
        proving_key: ProvingKey,
        verifying_key: VerifyingKey,
    ) -> Result<Self, String> {
        circuit.validate(&settings).map_err(|err| err.to_string())?;
        let circuit_digest = circuit.digest(&settings).map_err(|err| err.to_string())?;
        if proving_key.circuit_digest() != circuit_digest {
            return Err(format!(
                "proving key is bound to circuit {}, bundle circuit is {circuit_digest}",
                proving_key.circuit_digest()
            ));
        }
        if verifying_key.circuit_digest() != circuit_digest {
            return Err(format!(
                "verifying key is bound to circuit {}, bundle circuit is {circuit_digest}",
                verifying_key.circuit_digest()
            ));
        }
        if proving_key.verifying_key() != verifying_key {
            return Err("verifying key is not paired with the proving key".into());
        }
        Ok(Self {
            id: SliceId(settings.slice_index),
            settings,
            circuit,
            proving_key,
            verifying_key,
            circuit_digest,
        })
    }

    pub fn load(dir: &Path) -> Result<Self, SliceCircuitError> {
        let invalid = |reason: String| SliceCircuitError::InvalidBundle {
            path: dir.to_path_buf(),
            reason,
        };
        if !dir.is_dir() {
            return Err(invalid("not a directory".into()));
        }
        let settings =
            CircuitSettings::load(&dir.join(SETTINGS_FILE)).map_err(|err| invalid(err.to_string()))?;
        let circuit = CompiledCircuit::load(&dir.join(COMPILED_CIRCUIT_FILE))
            .map_err(|err| invalid(err.to_string()))?;
        let proving_key =
            ProvingKey::load(&dir.join(PROVING_KEY_FILE)).map_err(|err| invalid(err.to_string()))?;
        let verifying_key = VerifyingKey::load(&dir.join(VERIFYING_KEY_FILE))
            .map_err(|err| invalid(err.to_string()))?;

        if let Some(name) = dir.file_name().and_then(|name| name.to_str()) {
            if let Ok(id) = name.parse::<SliceId>() {
                if id.index() != settings.slice_index {
                    return Err(invalid(format!(
                        "directory is {id} but settings declare slice index {}",
                        settings.slice_index
                    )));
                }
            }
        }

        let bundle = Self::from_parts(settings, circuit, proving_key, verifying_key).map_err(invalid)?;
        debug!(
            slice = %bundle.id,
            circuit = %bundle.circuit_digest,
            vk = %bundle.verifying_key.fingerprint(),
            "loaded slice bundle"
        );
        Ok(bundle)
    }

    /// Write the four bundle files into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, SliceCircuitError> {
        fs::create_dir_all(dir).map_err(|err| SliceCircuitError::io(dir, err))?;
        let files = [
            (SETTINGS_FILE, serde_json::to_vec_pretty(&self.settings)?),
            (COMPILED_CIRCUIT_FILE, self.circuit.to_bytes()?),
            (PROVING_KEY_FILE, self.proving_key.to_bytes()?),
            (VERIFYING_KEY_FILE, self.verifying_key.to_bytes()?),
        ];
        for (name, bytes) in files {
            let path = dir.join(name);
            fs::write(&path, bytes).map_err(|err| SliceCircuitError::io(&path, err))?;
        }
        Ok(dir.to_path_buf())
    }

    pub fn id(&self) -> SliceId {
        self.id
    }

    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    pub fn circuit(&self) -> &CompiledCircuit {
        &self.circuit
    }

    pub fn proving_key(&self) -> &ProvingKey {
        &self.proving_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn circuit_digest(&self) -> Digest32 {
        self.circuit_digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_id_parses_directory_names() {
        assert_eq!("slice_0".parse::<SliceId>(), Ok(SliceId(0)));
        assert_eq!("slice_12".parse::<SliceId>(), Ok(SliceId(12)));
        assert!("slice_".parse::<SliceId>().is_err());
        assert!("slice_-1".parse::<SliceId>().is_err());
        assert!("layer_1".parse::<SliceId>().is_err());
        assert_eq!(SliceId(4).to_string(), "slice_4");
    }

    #[test]
    fn slice_id_serializes_as_string() {
        let json = serde_json::to_string(&SliceId(2)).expect("serialize");
        assert_eq!(json, "\"slice_2\"");
        let back: SliceId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, SliceId(2));
    }
}
