//! Session persistence under `<artifact_dir>/<task_id>/`.
//!
//! Layout:
//! - `last.ipynb`: current document
//! - `state_trajectory/<index>.ipynb`: one snapshot per inner iteration (0-based)
//! - `metadata.json`: counters, written last
//!
//! Every file is written atomically. Metadata is written after the snapshots
//! it counts, so a crash mid-save leaves "snapshot present, counter stale",
//! which `load` reports as an integrity error.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::session::AgentSession;
use crate::io::notebook_file::{load_document, save_document, write_atomic};

pub const LAST_FILE: &str = "last.ipynb";
pub const METADATA_FILE: &str = "metadata.json";
pub const TRAJECTORY_DIR: &str = "state_trajectory";
const SNAPSHOT_EXT: &str = "ipynb";

/// Persisted counters for one session (`metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    /// RFC 3339 timestamp of the last save.
    pub last_save: String,
    pub task_id: String,
    pub total_states: u32,
    pub total_iterations: u32,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub feedback: String,
}

/// Persisted state that cannot be trusted. Fatal; never repaired automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("total states {total_states} != total iterations {total_iterations}")]
    CounterMismatch {
        total_states: u32,
        total_iterations: u32,
    },
    #[error("metadata reports {expected} trajectory snapshots but {found} exist")]
    SnapshotCount { expected: u32, found: usize },
    #[error("metadata task id {found:?} does not match requested {expected:?}")]
    TaskIdMismatch { expected: String, found: String },
    #[error("session files exist in {dir} but metadata.json is missing")]
    MissingMetadata { dir: String },
}

/// File-backed store. Holds no session state of its own.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: artifact_dir.into(),
        }
    }

    pub fn session_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn last_path(&self, task_id: &str) -> PathBuf {
        self.session_dir(task_id).join(LAST_FILE)
    }

    pub fn metadata_path(&self, task_id: &str) -> PathBuf {
        self.session_dir(task_id).join(METADATA_FILE)
    }

    pub fn snapshot_path(&self, task_id: &str, index: usize) -> PathBuf {
        self.session_dir(task_id)
            .join(TRAJECTORY_DIR)
            .join(format!("{index}.{SNAPSHOT_EXT}"))
    }

    /// Load a session. `Ok(None)` when nothing was ever saved for `task_id`.
    ///
    /// Integrity checks run before any document is read.
    #[instrument(skip(self))]
    pub fn load(&self, task_id: &str) -> Result<Option<AgentSession>> {
        let metadata_path = self.metadata_path(task_id);
        if !metadata_path.exists() {
            let dir = self.session_dir(task_id);
            let snapshots = count_snapshots(&dir.join(TRAJECTORY_DIR))?;
            if snapshots > 0 || self.last_path(task_id).exists() {
                return Err(IntegrityError::MissingMetadata {
                    dir: dir.display().to_string(),
                }
                .into());
            }
            debug!(path = %metadata_path.display(), "no saved session");
            return Ok(None);
        }
        let metadata = read_metadata(&metadata_path)?;
        self.check_integrity(task_id, &metadata)?;

        let document = load_document(&self.last_path(task_id))?;
        let trajectory = (0..metadata.total_states as usize)
            .map(|index| load_document(&self.snapshot_path(task_id, index)))
            .collect::<Result<Vec<_>>>()?;

        info!(
            total_iterations = metadata.total_iterations,
            last_save = %metadata.last_save,
            "session loaded"
        );
        Ok(Some(AgentSession {
            task: metadata.task,
            task_id: metadata.task_id,
            feedback: metadata.feedback,
            document,
            trajectory,
            total_iterations: metadata.total_iterations,
        }))
    }

    /// Persist the session: snapshots newer than the last saved metadata,
    /// then `last.ipynb`, then metadata.
    ///
    /// Snapshot files beyond the persisted count are overwritten, so leftovers
    /// from a torn save never end up in the trajectory.
    #[instrument(skip_all, fields(task_id = %session.task_id, total_iterations = session.total_iterations))]
    pub fn save(&self, session: &AgentSession) -> Result<()> {
        let persisted = self.persisted_states(&session.task_id)?;
        let mut written = 0usize;
        for (index, snapshot) in session.trajectory.iter().enumerate().skip(persisted) {
            save_document(&self.snapshot_path(&session.task_id, index), snapshot)?;
            written += 1;
        }

        save_document(&self.last_path(&session.task_id), &session.document)?;

        let metadata = SessionMetadata {
            last_save: Utc::now().to_rfc3339(),
            task_id: session.task_id.clone(),
            total_states: u32::try_from(session.trajectory.len())
                .context("trajectory length overflows u32")?,
            total_iterations: session.total_iterations,
            task: session.task.clone(),
            feedback: session.feedback.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&metadata)?;
        buf.push('\n');
        write_atomic(&self.metadata_path(&session.task_id), &buf)?;

        debug!(snapshots_written = written, "session saved");
        Ok(())
    }

    /// Snapshot count recorded by the last completed save (0 if none).
    fn persisted_states(&self, task_id: &str) -> Result<usize> {
        let path = self.metadata_path(task_id);
        if !path.exists() {
            return Ok(0);
        }
        Ok(read_metadata(&path)?.total_states as usize)
    }

    fn check_integrity(&self, task_id: &str, metadata: &SessionMetadata) -> Result<()> {
        if metadata.task_id != task_id {
            return Err(IntegrityError::TaskIdMismatch {
                expected: task_id.to_string(),
                found: metadata.task_id.clone(),
            }
            .into());
        }
        if metadata.total_states != metadata.total_iterations {
            return Err(IntegrityError::CounterMismatch {
                total_states: metadata.total_states,
                total_iterations: metadata.total_iterations,
            }
            .into());
        }
        let found = count_snapshots(&self.session_dir(task_id).join(TRAJECTORY_DIR))?;
        if found != metadata.total_states as usize {
            return Err(IntegrityError::SnapshotCount {
                expected: metadata.total_states,
                found,
            }
            .into());
        }
        Ok(())
    }
}

fn read_metadata(path: &Path) -> Result<SessionMetadata> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read metadata {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse metadata {}", path.display()))
}

fn count_snapshots(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT) {
            count += 1;
        }
    }
    Ok(count)
}
