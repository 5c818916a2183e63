//! `run_results.json`: append-only record of every slice attempt in a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slice_circuit::SliceId;
use slice_crypto::Digest32;

use crate::state::{SliceStatus, Stage};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<u64>,
}

impl StageTimings {
    fn merge(&mut self, other: &StageTimings) {
        if other.witness.is_some() {
            self.witness = other.witness;
        }
        if other.proof.is_some() {
            self.proof = other.proof;
        }
        if other.verify.is_some() {
            self.verify = other.verify;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceAttempt {
    pub slice_id: SliceId,
    pub slice_index: u32,
    pub attempt: u32,
    pub status: SliceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_commitment: Option<Digest32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_commitment: Option<Digest32>,
    #[serde(default)]
    pub timings_ms: StageTimings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub updated_at: DateTime<Utc>,
}

/// Partial outcome of one stage, merged into the latest attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceUpdate {
    pub status: SliceStatus,
    pub input_commitment: Option<Digest32>,
    pub output_commitment: Option<Digest32>,
    pub timings_ms: StageTimings,
    pub failure: Option<FailureRecord>,
}

impl SliceUpdate {
    pub fn status(status: SliceStatus) -> Self {
        Self {
            status,
            input_commitment: None,
            output_commitment: None,
            timings_ms: StageTimings::default(),
            failure: None,
        }
    }

    pub fn failed(stage: Stage, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure: Some(FailureRecord {
                stage,
                kind: kind.into(),
                message: message.into(),
            }),
            ..Self::status(SliceStatus::Failed)
        }
    }

    pub fn with_input_commitment(mut self, commitment: Digest32) -> Self {
        self.input_commitment = Some(commitment);
        self
    }

    pub fn with_output_commitment(mut self, commitment: Digest32) -> Self {
        self.output_commitment = Some(commitment);
        self
    }

    pub fn with_timings(mut self, timings: StageTimings) -> Self {
        self.timings_ms = timings;
        self
    }
}

/// A merge that would move a slice backwards or skip a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RejectedMerge {
    pub slice: SliceId,
    pub from: SliceStatus,
    pub to: SliceStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: String,
    pub slices: Vec<SliceAttempt>,
}

impl RunResults {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            slices: Vec::new(),
        }
    }

    pub fn latest(&self, slice: SliceId) -> Option<&SliceAttempt> {
        self.slices.iter().rev().find(|entry| entry.slice_id == slice)
    }

    pub fn latest_status(&self, slice: SliceId) -> Option<SliceStatus> {
        self.latest(slice).map(|entry| entry.status)
    }

    pub fn attempts(&self, slice: SliceId) -> impl Iterator<Item = &SliceAttempt> {
        self.slices.iter().filter(move |entry| entry.slice_id == slice)
    }

    /// Slices that appear in the results, in index order.
    pub fn slice_ids(&self) -> Vec<SliceId> {
        let mut ids: Vec<SliceId> = self.slices.iter().map(|entry| entry.slice_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Merge `update` into the latest attempt of `slice`.
    ///
    /// The first update of a slice opens attempt 1. An update arriving after a
    /// failure opens the next attempt. Entries are never removed.
    pub fn merge(
        &mut self,
        slice: SliceId,
        update: SliceUpdate,
        now: DateTime<Utc>,
    ) -> Result<&SliceAttempt, RejectedMerge> {
        let latest = self
            .slices
            .iter()
            .rposition(|entry| entry.slice_id == slice);

        let opens_attempt = |from: SliceStatus| {
            update.status == SliceStatus::Created || from.can_advance_to(update.status)
        };

        let index = match latest {
            Some(position) if self.slices[position].status != SliceStatus::Failed => {
                let from = self.slices[position].status;
                if !from.can_advance_to(update.status) {
                    return Err(RejectedMerge {
                        slice,
                        from,
                        to: update.status,
                    });
                }
                position
            }
            previous => {
                let attempt = previous.map_or(1, |position| self.slices[position].attempt + 1);
                if !opens_attempt(SliceStatus::Created) {
                    return Err(RejectedMerge {
                        slice,
                        from: previous.map_or(SliceStatus::Created, |p| self.slices[p].status),
                        to: update.status,
                    });
                }
                self.slices.push(SliceAttempt {
                    slice_id: slice,
                    slice_index: slice.index(),
                    attempt,
                    status: SliceStatus::Created,
                    input_commitment: None,
                    output_commitment: None,
                    timings_ms: StageTimings::default(),
                    failure: None,
                    updated_at: now,
                });
                self.slices.len() - 1
            }
        };

        let entry = &mut self.slices[index];
        entry.status = update.status;
        if update.input_commitment.is_some() {
            entry.input_commitment = update.input_commitment;
        }
        if update.output_commitment.is_some() {
            entry.output_commitment = update.output_commitment;
        }
        entry.timings_ms.merge(&update.timings_ms);
        if update.failure.is_some() {
            entry.failure = update.failure;
        }
        entry.updated_at = now;
        Ok(entry)
    }

    /// Every listed slice's latest attempt is verified.
    pub fn is_complete(&self, slices: &[SliceId]) -> bool {
        !slices.is_empty()
            && slices
                .iter()
                .all(|slice| self.latest_status(*slice) == Some(SliceStatus::Verified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn forward_updates_merge_into_one_attempt() {
        let mut results = RunResults::new("run_20260101_000000");
        let slice = SliceId(0);
        results
            .merge(
                slice,
                SliceUpdate::status(SliceStatus::InputGenerated)
                    .with_input_commitment(Digest32([1u8; 32])),
                now(),
            )
            .expect("input");
        results
            .merge(
                slice,
                SliceUpdate::status(SliceStatus::WitnessGenerated)
                    .with_output_commitment(Digest32([2u8; 32]))
                    .with_timings(StageTimings {
                        witness: Some(3),
                        ..StageTimings::default()
                    }),
                now(),
            )
            .expect("witness");

        assert_eq!(results.slices.len(), 1);
        let latest = results.latest(slice).expect("latest");
        assert_eq!(latest.attempt, 1);
        assert_eq!(latest.status, SliceStatus::WitnessGenerated);
        assert_eq!(latest.input_commitment, Some(Digest32([1u8; 32])));
        assert_eq!(latest.timings_ms.witness, Some(3));
    }

    #[test]
    fn backwards_and_skipping_updates_are_rejected() {
        let mut results = RunResults::new("run");
        let slice = SliceId(1);
        let err = results
            .merge(slice, SliceUpdate::status(SliceStatus::ProofGenerated), now())
            .expect_err("skip");
        assert_eq!(err.to, SliceStatus::ProofGenerated);
        assert!(results.slices.is_empty());

        results
            .merge(slice, SliceUpdate::status(SliceStatus::InputGenerated), now())
            .expect("input");
        results
            .merge(slice, SliceUpdate::status(SliceStatus::Created), now())
            .expect_err("backwards");
    }

    #[test]
    fn retry_after_failure_appends_an_attempt() {
        let mut results = RunResults::new("run");
        let slice = SliceId(2);
        results
            .merge(slice, SliceUpdate::status(SliceStatus::InputGenerated), now())
            .expect("input");
        results
            .merge(
                slice,
                SliceUpdate::failed(Stage::Witness, "execution", "shape mismatch"),
                now(),
            )
            .expect("fail");
        results
            .merge(slice, SliceUpdate::status(SliceStatus::Created), now())
            .expect("retry");

        let attempts: Vec<_> = results.attempts(slice).collect();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, SliceStatus::Failed);
        assert_eq!(attempts[1].attempt, 2);
        assert_eq!(results.latest_status(slice), Some(SliceStatus::Created));
    }

    #[test]
    fn completion_requires_every_slice_verified() {
        let mut results = RunResults::new("run");
        for status in [
            SliceStatus::InputGenerated,
            SliceStatus::WitnessGenerated,
            SliceStatus::ProofGenerated,
            SliceStatus::Verified,
        ] {
            results
                .merge(SliceId(0), SliceUpdate::status(status), now())
                .expect("advance");
        }
        assert!(results.is_complete(&[SliceId(0)]));
        assert!(!results.is_complete(&[SliceId(0), SliceId(1)]));
        assert!(!results.is_complete(&[]));
    }
}
