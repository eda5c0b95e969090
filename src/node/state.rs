//! Replica state, snapshots and durable checkpoints.
//!
//! # Layout
//!
//! ```text
//! <dir>/node-<pid>-checkpoint.json   {"counter": 5, "lamport": 7}
//! <dir>/node-<pid>-precrash.json     {"preCounter": 5, "preLamport": 7}
//! ```
//!
//! Checkpoints are written to a temporary file, synced, then renamed over
//! the previous one, so a crash mid-write never leaves a torn checkpoint.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors reading or writing checkpoint files.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk checkpoint body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub counter: u64,
    pub lamport: u64,
}

/// Diagnostic pre-image written right before a simulated crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCrashRecord {
    pub pre_counter: u64,
    pub pre_lamport: u64,
}

/// Immutable point-in-time copy of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    pub counter: u64,
    pub lamport: u64,
}

impl From<CheckpointRecord> for StateSnapshot {
    fn from(record: CheckpointRecord) -> Self {
        StateSnapshot {
            counter: record.counter,
            lamport: record.lamport,
        }
    }
}

impl From<StateSnapshot> for CheckpointRecord {
    fn from(snap: StateSnapshot) -> Self {
        CheckpointRecord {
            counter: snap.counter,
            lamport: snap.lamport,
        }
    }
}

/// Result of offering a replicated update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was newer and is now the local state.
    Applied,
    /// The update was not newer than `last_applied` and was dropped.
    Stale { last_applied: u64 },
}

pub fn checkpoint_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("node-{}-checkpoint.json", pid))
}

pub fn precrash_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("node-{}-precrash.json", pid))
}

/// A node's view of the shared counter.
///
/// Every read, mutation, snapshot and file operation runs under one lock.
#[derive(Debug)]
pub struct ReplicaState {
    pid: u32,
    inner: Mutex<StateSnapshot>,
    checkpoint_path: PathBuf,
    precrash_path: PathBuf,
}

impl ReplicaState {
    /// Build a replica for `pid` with zero state, without touching disk.
    pub fn new(pid: u32, dir: &Path) -> Self {
        ReplicaState {
            pid,
            inner: Mutex::new(StateSnapshot::default()),
            checkpoint_path: checkpoint_path(dir, pid),
            precrash_path: precrash_path(dir, pid),
        }
    }

    /// Build a replica and load the latest checkpoint if one exists.
    ///
    /// A missing checkpoint is a cold start at zero.
    pub fn open(pid: u32, dir: &Path) -> Result<Self, CheckpointError> {
        let replica = Self::new(pid, dir);
        match replica.load_checkpoint()? {
            Some(snap) => info!(pid, counter = snap.counter, lamport = snap.lamport, "checkpoint loaded"),
            None => info!(pid, "no checkpoint found; starting from zero"),
        }
        Ok(replica)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn counter(&self) -> u64 {
        self.inner.lock().counter
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.lock().lamport
    }

    /// Pre-image of the current state.
    pub fn snapshot(&self) -> StateSnapshot {
        *self.inner.lock()
    }

    /// Apply this node's own critical operation, stamped with `timestamp`.
    pub fn apply_local(&self, delta: u64, timestamp: u64) -> StateSnapshot {
        let mut state = self.inner.lock();
        state.counter += delta;
        state.lamport = state.lamport.max(timestamp);
        *state
    }

    /// Offer a replicated `(counter, timestamp)`.
    ///
    /// Applied only when `timestamp` is strictly newer than the last applied
    /// one; duplicates and reordered older updates are dropped.
    pub fn apply_remote(&self, counter: u64, timestamp: u64) -> ApplyOutcome {
        let mut state = self.inner.lock();
        if timestamp <= state.lamport {
            return ApplyOutcome::Stale {
                last_applied: state.lamport,
            };
        }
        state.counter = counter;
        state.lamport = timestamp;
        ApplyOutcome::Applied
    }

    /// Replace the whole state.
    pub fn restore(&self, snap: StateSnapshot) {
        *self.inner.lock() = snap;
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn precrash_path(&self) -> &Path {
        &self.precrash_path
    }

    /// Persist the current state.
    pub fn save_checkpoint(&self) -> Result<StateSnapshot, CheckpointError> {
        let state = self.inner.lock();
        write_json_atomic(&self.checkpoint_path, &CheckpointRecord::from(*state))?;
        debug!(pid = self.pid, counter = state.counter, lamport = state.lamport, "checkpoint saved");
        Ok(*state)
    }

    /// Replace the in-memory state with the durable checkpoint, if any.
    pub fn load_checkpoint(&self) -> Result<Option<StateSnapshot>, CheckpointError> {
        let mut state = self.inner.lock();
        let loaded = read_checkpoint(&self.checkpoint_path)?.map(StateSnapshot::from);
        if let Some(snap) = loaded {
            *state = snap;
        }
        Ok(loaded)
    }

    /// Discard local changes and return to the last checkpoint.
    ///
    /// Without a checkpoint the replica returns to zero state.
    pub fn rollback_to_checkpoint(&self) -> Result<StateSnapshot, CheckpointError> {
        let mut state = self.inner.lock();
        let restored = read_checkpoint(&self.checkpoint_path)?
            .map(StateSnapshot::from)
            .unwrap_or_default();
        *state = restored;
        Ok(restored)
    }

    /// Persist `pre_image` as the pre-crash diagnostic record.
    pub fn write_precrash(&self, pre_image: StateSnapshot) -> Result<(), CheckpointError> {
        let _state = self.inner.lock();
        write_json_atomic(
            &self.precrash_path,
            &PreCrashRecord {
                pre_counter: pre_image.counter,
                pre_lamport: pre_image.lamport,
            },
        )
    }
}

/// Read a checkpoint file. `Ok(None)` if it does not exist.
pub fn read_checkpoint(path: &Path) -> Result<Option<CheckpointRecord>, CheckpointError> {
    read_json(path)
}

/// Read a pre-crash record. `Ok(None)` if it does not exist.
pub fn read_precrash(path: &Path) -> Result<Option<PreCrashRecord>, CheckpointError> {
    read_json(path)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CheckpointError::Format {
            path: path.to_path_buf(),
            source,
        })
}

/// Write → fsync → rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec(value).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&temp_path, path).map_err(io_err)?;
    Ok(())
}
