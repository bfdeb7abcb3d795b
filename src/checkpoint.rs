use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{HistoryError, HistoryStore, Session};
use crate::storage::{HistoryFile, SaveError, write_atomically};

const CHECKPOINT_SUFFIX: &str = "checkpoint.json";

/// Marker of a session that was still running as of `last_heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCheckpoint {
    pub project: String,
    pub start: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write checkpoint {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to remove checkpoint {}: {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("could not record the interrupted session: {0}")]
    History(#[from] HistoryError),
    #[error("could not save the interrupted session: {0}")]
    Save(#[from] SaveError),
    #[error(transparent)]
    Clear(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    NothingToRecover,
    Recovered { project: String, session: Session },
    /// The checkpoint described a session already present in the history.
    AlreadyCommitted { project: String },
    /// Heartbeat not after start; dropped without creating a session.
    Discarded(OpenCheckpoint),
}

#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint paired with a history file: `history.json` gets
    /// `history.checkpoint.json` in the same directory.
    pub fn beside(history_path: &Path) -> Self {
        let stem = history_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "history".to_string());
        Self::new(history_path.with_file_name(format!("{stem}.{CHECKPOINT_SUFFIX}")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(
        &self,
        project: &str,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        let checkpoint = OpenCheckpoint {
            project: project.to_string(),
            start,
            last_heartbeat: now,
        };
        let encoded = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomically(&self.path, &encoded).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(project, heartbeat = %now, "checkpoint written");
        Ok(())
    }

    /// Returns the open checkpoint, if any. Unreadable or malformed files
    /// count as absent and are removed.
    pub fn read(&self) -> Option<OpenCheckpoint> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable checkpoint ignored");
                self.discard_corrupt();
                return None;
            }
        };

        match serde_json::from_str::<OpenCheckpoint>(&raw) {
            Ok(checkpoint) if !checkpoint.project.trim().is_empty() => Some(checkpoint),
            Ok(_) => {
                warn!(path = %self.path.display(), "checkpoint without project ignored");
                self.discard_corrupt();
                None
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "malformed checkpoint ignored");
                self.discard_corrupt();
                None
            }
        }
    }

    pub fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn discard_corrupt(&self) {
        if let Err(err) = self.clear() {
            warn!(error = %err, "corrupt checkpoint could not be removed");
        }
    }
}

/// Closes a session left open by an abnormal exit into `history`.
///
/// The recovered session ends at the last heartbeat, so it undercounts by
/// at most one heartbeat interval. The checkpoint is only cleared once the
/// history has been saved; a failed save leaves both the store and the
/// checkpoint as they were.
pub fn recover(
    checkpoint_file: &CheckpointFile,
    history: &mut HistoryStore,
    history_file: &HistoryFile,
) -> Result<RecoveryOutcome, RecoveryError> {
    let Some(checkpoint) = checkpoint_file.read() else {
        return Ok(RecoveryOutcome::NothingToRecover);
    };

    if checkpoint.last_heartbeat <= checkpoint.start {
        warn!(
            project = %checkpoint.project,
            start = %checkpoint.start,
            heartbeat = %checkpoint.last_heartbeat,
            "discarding checkpoint whose heartbeat does not follow its start"
        );
        checkpoint_file.clear()?;
        return Ok(RecoveryOutcome::Discarded(checkpoint));
    }

    let already_committed = history
        .project(&checkpoint.project)
        .map(|record| {
            record
                .sessions()
                .iter()
                .any(|session| session.start == checkpoint.start)
        })
        .unwrap_or(false);
    if already_committed {
        info!(project = %checkpoint.project, "checkpoint already committed, clearing");
        checkpoint_file.clear()?;
        return Ok(RecoveryOutcome::AlreadyCommitted {
            project: checkpoint.project,
        });
    }

    let session = Session::closed(checkpoint.start, checkpoint.last_heartbeat);
    let previous = history.clone();
    history.add_session(&checkpoint.project, session.clone())?;
    if let Err(err) = history_file.save(history) {
        *history = previous;
        return Err(err.into());
    }
    checkpoint_file.clear()?;

    info!(
        project = %checkpoint.project,
        seconds = session.duration_seconds,
        checkpoint = %checkpoint_file.path().display(),
        "recovered interrupted session"
    );
    Ok(RecoveryOutcome::Recovered {
        project: checkpoint.project,
        session,
    })
}
