//! Run directories.
//!
//! A run lives in `<run_root>/run_{YYYYMMDD}_{HHMMSS}[_frac]/`. Identifiers
//! are allocated with an atomic `create_dir`, escalate to millisecond,
//! microsecond and nanosecond resolution on collision, and always sort after
//! every run already present. A [`RunRecord`] holds an exclusive advisory lock
//! on the run's `.lock` file for as long as it lives.

use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use slice_circuit::constants::PROOF_SYSTEM;
use slice_circuit::SliceId;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::fsutil::{read_json, write_json_atomic};
use crate::results::{RunResults, SliceAttempt, SliceUpdate};
use crate::state::Stage;

pub const RUN_PREFIX: &str = "run_";
pub const RUN_RESULTS_FILE: &str = "run_results.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = ".lock";

/// Attempts before `create_run` gives up with `DirectoryCollision`.
const MAX_CREATE_ATTEMPTS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdResolution {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl IdResolution {
    const LADDER: [IdResolution; 4] = [
        IdResolution::Seconds,
        IdResolution::Millis,
        IdResolution::Micros,
        IdResolution::Nanos,
    ];

    fn digits(self) -> usize {
        match self {
            IdResolution::Seconds => 0,
            IdResolution::Millis => 3,
            IdResolution::Micros => 6,
            IdResolution::Nanos => 9,
        }
    }

    fn unit_nanos(self) -> u32 {
        match self {
            IdResolution::Seconds => 1_000_000_000,
            IdResolution::Millis => 1_000_000,
            IdResolution::Micros => 1_000,
            IdResolution::Nanos => 1,
        }
    }

    fn from_digits(digits: usize) -> Option<Self> {
        Self::LADDER.into_iter().find(|r| r.digits() == digits)
    }
}

/// Timestamp identifier of a run, ordered by time and then resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId {
    timestamp: NaiveDateTime,
    resolution: IdResolution,
}

impl RunId {
    /// Identifier for `at`, truncated to `resolution`.
    pub fn at(at: NaiveDateTime, resolution: IdResolution) -> Self {
        let unit = resolution.unit_nanos();
        let nanos = (at.nanosecond() % 1_000_000_000) / unit * unit;
        let timestamp = at.with_nanosecond(nanos).unwrap_or(at);
        Self {
            timestamp,
            resolution,
        }
    }

    pub fn now(resolution: IdResolution) -> Self {
        Self::at(Utc::now().naive_utc(), resolution)
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn resolution(&self) -> IdResolution {
        self.resolution
    }

    /// Smallest nanosecond identifier that sorts after `self`.
    fn bumped(&self) -> Self {
        let next = self.timestamp + ChronoDuration::nanoseconds(1);
        Self {
            timestamp: next,
            resolution: IdResolution::Nanos,
        }
    }
}

impl Ord for RunId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.resolution.cmp(&other.resolution))
    }
}

impl PartialOrd for RunId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{RUN_PREFIX}{}", self.timestamp.format("%Y%m%d_%H%M%S"))?;
        let digits = self.resolution.digits();
        if digits > 0 {
            let frac = (self.timestamp.nanosecond() % 1_000_000_000) / self.resolution.unit_nanos();
            write!(f, "_{frac:0digits$}")?;
        }
        Ok(())
    }
}

impl FromStr for RunId {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::Configuration(format!("{value:?} is not a run id"));
        let rest = value.strip_prefix(RUN_PREFIX).ok_or_else(invalid)?;
        let mut parts = rest.split('_');
        let date = parts.next().ok_or_else(invalid)?;
        let time = parts.next().ok_or_else(invalid)?;
        let frac = parts.next();
        if parts.next().is_some() || date.len() != 8 || time.len() != 6 {
            return Err(invalid());
        }
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(date) || !all_digits(time) {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|_| invalid())?;
        let time = NaiveTime::parse_from_str(time, "%H%M%S").map_err(|_| invalid())?;
        let (resolution, nanos) = match frac {
            None => (IdResolution::Seconds, 0),
            Some(frac) => {
                if !all_digits(frac) {
                    return Err(invalid());
                }
                let resolution = IdResolution::from_digits(frac.len()).ok_or_else(invalid)?;
                let count: u32 = frac.parse().map_err(|_| invalid())?;
                (resolution, count * resolution.unit_nanos())
            }
        };
        let timestamp = date
            .and_time(time)
            .with_nanosecond(nanos)
            .ok_or_else(invalid)?;
        Ok(Self {
            timestamp,
            resolution,
        })
    }
}

impl Serialize for RunId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Run-root metadata (`metadata.json`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub proof_system: String,
    pub slices_dir: String,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            proof_system: PROOF_SYSTEM.to_string(),
            slices_dir: "slices/".to_string(),
        }
    }
}

/// Exclusive advisory lock on `run_*/.lock`, released on drop.
#[derive(Debug)]
struct RunLock {
    file: File,
}

impl RunLock {
    fn acquire(run_dir: &Path, id: &RunId) -> PipelineResult<Self> {
        let path = run_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| PipelineError::io(&path, err))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(PipelineError::RunLocked {
                    run: id.to_string(),
                })
            }
            Err(err) => Err(PipelineError::io(&path, err)),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// An open run: its identifier, directory and results, plus the writer lock.
#[derive(Debug)]
pub struct RunRecord {
    id: RunId,
    root_dir: PathBuf,
    results: RunResults,
    _lock: RunLock,
}

impl RunRecord {
    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn results(&self) -> &RunResults {
        &self.results
    }

    pub fn slice_dir(&self, slice: SliceId) -> PathBuf {
        self.root_dir.join(slice.to_string())
    }

    pub fn results_path(&self) -> PathBuf {
        self.root_dir.join(RUN_RESULTS_FILE)
    }

    /// Merge a stage outcome into the results and persist them atomically.
    pub fn record(&mut self, slice: SliceId, update: SliceUpdate) -> PipelineResult<SliceAttempt> {
        let status = update.status;
        let mut next = self.results.clone();
        let attempt = next
            .merge(slice, update, Utc::now())
            .map_err(|rejected| {
                let stage = Stage::producing(rejected.to);
                PipelineError::OutOfOrder {
                    slice: rejected.slice,
                    stage,
                    expected: stage.requires(),
                    actual: rejected.from,
                }
            })?
            .clone();
        write_json_atomic(&self.results_path(), &next)?;
        self.results = next;
        debug!(run = %self.id, slice = %slice, status = %status, "recorded slice result");
        Ok(attempt)
    }

    fn open(dir: PathBuf, id: RunId) -> PipelineResult<Self> {
        let lock = RunLock::acquire(&dir, &id)?;
        let results_path = dir.join(RUN_RESULTS_FILE);
        let results = if results_path.exists() {
            read_json(&results_path)?
        } else {
            RunResults::new(id.to_string())
        };
        Ok(Self {
            id,
            root_dir: dir,
            results,
            _lock: lock,
        })
    }
}

/// Allocates, opens and cleans up runs under one run root.
#[derive(Clone, Debug)]
pub struct RunManager {
    root: PathBuf,
    metadata: RunMetadata,
}

impl RunManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metadata: RunMetadata::default(),
        }
    }

    pub fn with_metadata(root: impl Into<PathBuf>, metadata: RunMetadata) -> Self {
        Self {
            root: root.into(),
            metadata,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh run directory and open it.
    pub fn create_run(&self) -> PipelineResult<RunRecord> {
        fs::create_dir_all(&self.root).map_err(|err| PipelineError::io(&self.root, err))?;
        self.ensure_metadata()?;

        let mut floor = self.list_runs()?.into_iter().max();
        for attempt in 0..MAX_CREATE_ATTEMPTS {
            let resolution = IdResolution::LADDER[attempt.min(IdResolution::LADDER.len() - 1)];
            let mut id = RunId::now(resolution);
            if let Some(latest) = floor {
                if id <= latest {
                    if resolution != IdResolution::Nanos {
                        continue;
                    }
                    id = latest.bumped();
                }
            }
            let dir = self.root.join(id.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let record = RunRecord::open(dir, id)?;
                    info!(run = %id, root = %self.root.display(), "created run");
                    return Ok(record);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(run = %id, "run directory exists, escalating identifier");
                    let latest = self.list_runs()?.into_iter().max();
                    floor = floor.max(latest).max(Some(id));
                }
                Err(err) => return Err(PipelineError::io(&dir, err)),
            }
        }
        Err(PipelineError::DirectoryCollision {
            root: self.root.clone(),
            reason: format!("no free run identifier after {MAX_CREATE_ATTEMPTS} attempts"),
        })
    }

    pub fn open_run(&self, id: &RunId) -> PipelineResult<RunRecord> {
        let dir = self.root.join(id.to_string());
        if !dir.is_dir() {
            return Err(PipelineError::NotFound(format!(
                "run {id} under {}",
                self.root.display()
            )));
        }
        RunRecord::open(dir, *id)
    }

    pub fn get_latest_run(&self) -> PipelineResult<RunRecord> {
        let latest = self.list_runs()?.into_iter().max().ok_or_else(|| {
            PipelineError::NotFound(format!("no runs under {}", self.root.display()))
        })?;
        self.open_run(&latest)
    }

    /// Run identifiers under the root, oldest first.
    pub fn list_runs(&self) -> PipelineResult<Vec<RunId>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PipelineError::io(&self.root, err)),
        };
        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::io(&self.root, err))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RunId>().ok())
            {
                runs.push(id);
            }
        }
        runs.sort();
        Ok(runs)
    }

    pub fn record_result(
        &self,
        run: &mut RunRecord,
        slice: SliceId,
        update: SliceUpdate,
    ) -> PipelineResult<SliceAttempt> {
        run.record(slice, update)
    }

    /// Every listed slice's latest attempt is verified.
    pub fn check_run_completion(&self, run: &RunRecord, slices: &[SliceId]) -> bool {
        run.results().is_complete(slices)
    }

    /// Delete a run directory. Operator-invoked only.
    pub fn cleanup_run(&self, run: RunRecord) -> PipelineResult<()> {
        let dir = run.dir().to_path_buf();
        let id = *run.id();
        fs::remove_dir_all(&dir).map_err(|err| PipelineError::io(&dir, err))?;
        drop(run);
        info!(run = %id, "removed run");
        Ok(())
    }

    /// Delete every run that is not currently locked. Returns how many were removed.
    pub fn cleanup_all(&self) -> PipelineResult<usize> {
        let mut removed = 0;
        for id in self.list_runs()? {
            match self.open_run(&id) {
                Ok(run) => {
                    self.cleanup_run(run)?;
                    removed += 1;
                }
                Err(PipelineError::RunLocked { run }) => {
                    warn!(run = %run, "skipping locked run");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Write `metadata.json` once; an existing file must agree on the proof system.
    fn ensure_metadata(&self) -> PipelineResult<()> {
        let path = self.root.join(METADATA_FILE);
        if path.exists() {
            let existing: RunMetadata = read_json(&path)?;
            if existing.proof_system != self.metadata.proof_system {
                return Err(PipelineError::Configuration(format!(
                    "run root {} holds {} proofs, pipeline produces {}",
                    self.root.display(),
                    existing.proof_system,
                    self.metadata.proof_system
                )));
            }
            return Ok(());
        }
        write_json_atomic(&path, &self.metadata)
    }
}
