//! Per-slice lifecycle.
//!
//! [`SliceStatus`] is the persisted view written to `run_results.json`.
//! [`SliceStage`] is the in-memory view: each variant carries the data the
//! next stage needs, and each transition consumes the previous variant.

use std::fmt;

use serde::{Deserialize, Serialize};
use slice_circuit::{SliceProof, Tensor, Witness};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Created,
    InputGenerated,
    WitnessGenerated,
    ProofGenerated,
    Verified,
    Failed,
}

impl SliceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SliceStatus::Created => "created",
            SliceStatus::InputGenerated => "input_generated",
            SliceStatus::WitnessGenerated => "witness_generated",
            SliceStatus::ProofGenerated => "proof_generated",
            SliceStatus::Verified => "verified",
            SliceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SliceStatus::Verified | SliceStatus::Failed)
    }

    /// The only status a successful stage may move to next.
    pub fn successor(self) -> Option<SliceStatus> {
        match self {
            SliceStatus::Created => Some(SliceStatus::InputGenerated),
            SliceStatus::InputGenerated => Some(SliceStatus::WitnessGenerated),
            SliceStatus::WitnessGenerated => Some(SliceStatus::ProofGenerated),
            SliceStatus::ProofGenerated => Some(SliceStatus::Verified),
            SliceStatus::Verified | SliceStatus::Failed => None,
        }
    }

    pub fn can_advance_to(self, next: SliceStatus) -> bool {
        if next == SliceStatus::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(next)
    }
}

impl fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage, as named in errors and failure records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Witness,
    Proof,
    Verify,
    Retry,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Witness => "witness",
            Stage::Proof => "proof",
            Stage::Verify => "verify",
            Stage::Retry => "retry",
        }
    }

    /// Stage whose success moves a slice into `status`.
    pub fn producing(status: SliceStatus) -> Stage {
        match status {
            SliceStatus::InputGenerated => Stage::Input,
            SliceStatus::WitnessGenerated => Stage::Witness,
            SliceStatus::ProofGenerated => Stage::Proof,
            SliceStatus::Verified => Stage::Verify,
            SliceStatus::Created | SliceStatus::Failed => Stage::Retry,
        }
    }

    /// Status the slice must be in before this stage may run.
    pub fn requires(self) -> SliceStatus {
        match self {
            Stage::Input => SliceStatus::Created,
            Stage::Witness => SliceStatus::InputGenerated,
            Stage::Proof => SliceStatus::WitnessGenerated,
            Stage::Verify => SliceStatus::ProofGenerated,
            Stage::Retry => SliceStatus::Failed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub enum SliceStage {
    Created,
    InputGenerated {
        input: Tensor,
    },
    WitnessGenerated {
        input: Tensor,
        witness: Witness,
    },
    ProofGenerated {
        witness: Witness,
        proof: SliceProof,
    },
    Verified {
        proof: SliceProof,
    },
    Failed {
        stage: Stage,
        kind: String,
        message: String,
    },
}

/// A refused transition hands the untouched stage back.
#[derive(Debug)]
pub struct Refused {
    pub stage: SliceStage,
    pub to: SliceStatus,
}

impl Refused {
    pub fn from(&self) -> SliceStatus {
        self.stage.status()
    }
}

pub type Transition = Result<SliceStage, Box<Refused>>;

impl SliceStage {
    pub fn status(&self) -> SliceStatus {
        match self {
            SliceStage::Created => SliceStatus::Created,
            SliceStage::InputGenerated { .. } => SliceStatus::InputGenerated,
            SliceStage::WitnessGenerated { .. } => SliceStatus::WitnessGenerated,
            SliceStage::ProofGenerated { .. } => SliceStatus::ProofGenerated,
            SliceStage::Verified { .. } => SliceStatus::Verified,
            SliceStage::Failed { .. } => SliceStatus::Failed,
        }
    }

    pub fn input(&self) -> Option<&Tensor> {
        match self {
            SliceStage::InputGenerated { input } | SliceStage::WitnessGenerated { input, .. } => {
                Some(input)
            }
            SliceStage::ProofGenerated { witness, .. } => Some(&witness.trace.input),
            _ => None,
        }
    }

    pub fn witness(&self) -> Option<&Witness> {
        match self {
            SliceStage::WitnessGenerated { witness, .. }
            | SliceStage::ProofGenerated { witness, .. } => Some(witness),
            _ => None,
        }
    }

    pub fn proof(&self) -> Option<&SliceProof> {
        match self {
            SliceStage::ProofGenerated { proof, .. } | SliceStage::Verified { proof } => Some(proof),
            _ => None,
        }
    }

    pub fn with_input(self, input: Tensor) -> Transition {
        match self {
            SliceStage::Created => Ok(SliceStage::InputGenerated { input }),
            other => Err(other.refuse(SliceStatus::InputGenerated)),
        }
    }

    pub fn with_witness(self, witness: Witness) -> Transition {
        match self {
            SliceStage::InputGenerated { input } => Ok(SliceStage::WitnessGenerated { input, witness }),
            other => Err(other.refuse(SliceStatus::WitnessGenerated)),
        }
    }

    pub fn with_proof(self, proof: SliceProof) -> Transition {
        match self {
            SliceStage::WitnessGenerated { witness, .. } => {
                Ok(SliceStage::ProofGenerated { witness, proof })
            }
            other => Err(other.refuse(SliceStatus::ProofGenerated)),
        }
    }

    pub fn verified(self) -> Transition {
        match self {
            SliceStage::ProofGenerated { proof, .. } => Ok(SliceStage::Verified { proof }),
            other => Err(other.refuse(SliceStatus::Verified)),
        }
    }

    pub fn failed(self, stage: Stage, kind: impl Into<String>, message: impl Into<String>) -> Transition {
        if self.status().is_terminal() {
            return Err(self.refuse(SliceStatus::Failed));
        }
        Ok(SliceStage::Failed {
            stage,
            kind: kind.into(),
            message: message.into(),
        })
    }

    /// Start a fresh attempt after a failure.
    pub fn retried(self) -> Transition {
        match self {
            SliceStage::Failed { .. } => Ok(SliceStage::Created),
            other => Err(other.refuse(SliceStatus::Created)),
        }
    }

    fn refuse(self, to: SliceStatus) -> Box<Refused> {
        Box::new(Refused { stage: self, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_only_move_forward() {
        use SliceStatus::*;
        assert!(Created.can_advance_to(InputGenerated));
        assert!(!Created.can_advance_to(WitnessGenerated));
        assert!(!WitnessGenerated.can_advance_to(InputGenerated));
        assert!(ProofGenerated.can_advance_to(Verified));
        assert!(InputGenerated.can_advance_to(Failed));
        assert!(!Verified.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Created));
    }

    #[test]
    fn illegal_transition_returns_the_stage() {
        let refused = SliceStage::Created.verified().expect_err("cannot verify before proving");
        assert_eq!(refused.from(), SliceStatus::Created);
        assert_eq!(refused.to, SliceStatus::Verified);
        assert!(matches!(refused.stage, SliceStage::Created));
    }

    #[test]
    fn failure_is_terminal_until_retried() {
        let input = Tensor::new(vec![1], vec![0.5]).expect("tensor");
        let stage = SliceStage::Created.with_input(input).expect("input");
        let failed = stage.failed(Stage::Witness, "execution", "boom").expect("fail");
        assert_eq!(failed.status(), SliceStatus::Failed);

        let refused = failed.failed(Stage::Witness, "execution", "again").expect_err("terminal");
        let retried = refused.stage.retried().expect("retry");
        assert_eq!(retried.status(), SliceStatus::Created);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SliceStatus::WitnessGenerated).expect("json");
        assert_eq!(json, "\"witness_generated\"");
    }
}
