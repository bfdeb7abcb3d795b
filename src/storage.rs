use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{HistoryError, HistoryStore, ProjectRecord, Session, add_seconds};
use crate::report::local_naive_to_utc_resolved;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read history {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse history {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid record for {project} in {}: {source}", .path.display())]
    InvalidRecord {
        path: PathBuf,
        project: String,
        source: HistoryError,
    },
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write history {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Every shape a project entry has had on disk. Only `load` sees this type;
/// everything past it works with `ProjectRecord`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Legacy(f64),
    Structured(StructuredRecord),
    Localized(LocalizedRecord),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StructuredRecord {
    #[serde(default)]
    total_seconds: f64,
    #[serde(default)]
    untracked_seconds: f64,
    sessions: Vec<Session>,
}

/// The first structured layout: Portuguese keys and naive local start times.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalizedRecord {
    #[serde(default)]
    total_segundos: f64,
    sessoes: Vec<LocalizedSession>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalizedSession {
    data: String,
    duracao_segundos: f64,
}

impl LocalizedSession {
    fn into_session(self) -> Result<Session, HistoryError> {
        let start = parse_session_start(&self.data)
            .ok_or(HistoryError::InvalidSession("start is not an ISO 8601 timestamp"))?;
        let end = (self.duracao_segundos > 0.0)
            .then(|| add_seconds(start, self.duracao_segundos))
            .flatten()
            .filter(|end| *end > start);
        Ok(Session {
            start,
            end,
            duration_seconds: self.duracao_segundos,
        })
    }
}

fn parse_session_start(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .ok()
        .map(local_naive_to_utc_resolved)
}

impl StoredRecord {
    fn migrate(self) -> Result<ProjectRecord, HistoryError> {
        let (total_seconds, untracked_seconds, sessions) = match self {
            StoredRecord::Legacy(total_seconds) => {
                return Ok(ProjectRecord::from_legacy_total(total_seconds));
            }
            StoredRecord::Structured(record) => {
                (record.total_seconds, record.untracked_seconds, record.sessions)
            }
            StoredRecord::Localized(record) => {
                let sessions = record
                    .sessoes
                    .into_iter()
                    .map(LocalizedSession::into_session)
                    .collect::<Result<Vec<_>, _>>()?;
                (record.total_segundos, 0.0, sessions)
            }
        };

        for session in &sessions {
            session.validate()?;
        }
        Ok(ProjectRecord::reconcile(total_seconds, untracked_seconds, sessions))
    }
}

/// The JSON document backing a `HistoryStore`.
#[derive(Debug, Clone)]
pub struct HistoryFile {
    path: PathBuf,
}

impl HistoryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the history. A missing or blank file is an empty store.
    pub fn load(&self) -> Result<HistoryStore, LoadError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "history file absent, starting empty");
                return Ok(HistoryStore::new());
            }
            Err(source) => {
                return Err(LoadError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if raw.trim().is_empty() {
            return Ok(HistoryStore::new());
        }

        let stored: BTreeMap<String, StoredRecord> =
            serde_json::from_str(&raw).map_err(|source| LoadError::Parse {
                path: self.path.clone(),
                source,
            })?;

        let mut projects = BTreeMap::new();
        for (project, record) in stored {
            let record = record.migrate().map_err(|source| LoadError::InvalidRecord {
                path: self.path.clone(),
                project: project.clone(),
                source,
            })?;
            projects.insert(project, record);
        }
        debug!(path = %self.path.display(), projects = projects.len(), "history loaded");
        Ok(HistoryStore::from_records(projects))
    }

    pub fn save(&self, store: &HistoryStore) -> Result<(), SaveError> {
        let mut encoded = serde_json::to_string_pretty(store)?;
        encoded.push('\n');
        write_atomically(&self.path, encoded.as_bytes()).map_err(|source| SaveError::Write {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "history saved");
        Ok(())
    }

    /// Moves an unreadable history aside so that starting over cannot
    /// overwrite it. Returns where the file went.
    pub fn quarantine(&self, now: DateTime<Utc>) -> io::Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "history.json".to_string());
        let target = self.path.with_file_name(format!(
            "{file_name}.corrupt-{}",
            now.format("%Y%m%dT%H%M%S")
        ));
        fs::rename(&self.path, &target)?;
        warn!(from = %self.path.display(), to = %target.display(), "unreadable history moved aside");
        Ok(target)
    }
}

/// Writes `contents` to a temporary sibling of `path` and renames it into
/// place, so a failed write never leaves `path` truncated.
pub fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
