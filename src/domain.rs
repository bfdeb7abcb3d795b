use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Legacy totals below this are float noise from the old incremental sums.
const UNTRACKED_EPSILON: f64 = 1e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HistoryError {
    #[error("project name must not be empty")]
    EmptyProject,
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("project {project} has no session #{} ({len} recorded)", .index + 1)]
    SessionIndexOutOfRange {
        project: String,
        index: usize,
        len: usize,
    },
    #[error("invalid session: {0}")]
    InvalidSession(&'static str),
}

/// One completed work interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl Session {
    /// Builds a session closed at `end`. When `end` does not come after
    /// `start` the session is zero-length and carries no end timestamp.
    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if end > start {
            Self {
                start,
                end: Some(end),
                duration_seconds: seconds_between(start, end),
            }
        } else {
            Self {
                start,
                end: None,
                duration_seconds: 0.0,
            }
        }
    }

    pub fn validate(&self) -> Result<(), HistoryError> {
        if !self.duration_seconds.is_finite() || self.duration_seconds < 0.0 {
            return Err(HistoryError::InvalidSession(
                "duration must be a non-negative number of seconds",
            ));
        }

        if let Some(end) = self.end {
            if end <= self.start {
                return Err(HistoryError::InvalidSession("end must be after start"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    total_seconds: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    untracked_seconds: f64,
    #[serde(default)]
    sessions: Vec<Session>,
}

impl ProjectRecord {
    /// A record migrated from the bare-number layout: a total with no sessions.
    pub fn from_legacy_total(total_seconds: f64) -> Self {
        let untracked_seconds = sanitize_seconds(total_seconds);
        Self {
            total_seconds: untracked_seconds,
            untracked_seconds,
            sessions: Vec::new(),
        }
    }

    /// Normalizes a structured record read from disk. A stored total larger
    /// than the session sum is kept as untracked time; the total itself is
    /// always recomputed.
    pub fn reconcile(stored_total: f64, stored_untracked: f64, sessions: Vec<Session>) -> Self {
        let session_sum = sum_durations(&sessions);
        let stored_untracked = sanitize_seconds(stored_untracked);
        let untracked_seconds = if stored_untracked > 0.0 {
            stored_untracked
        } else {
            let excess = sanitize_seconds(stored_total) - session_sum;
            if excess > UNTRACKED_EPSILON { excess } else { 0.0 }
        };

        let mut record = Self {
            total_seconds: 0.0,
            untracked_seconds,
            sessions,
        };
        record.recompute_total();
        record
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }

    /// Time carried over from the legacy totals-only layout.
    pub fn untracked_seconds(&self) -> f64 {
        self.untracked_seconds
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    fn recompute_total(&mut self) {
        self.total_seconds = self.untracked_seconds + sum_durations(&self.sessions);
    }
}

/// Aggregated sessions of one project inside a queried period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodTotals {
    pub sessions: Vec<Session>,
    pub total_seconds: f64,
}

/// Completed sessions keyed by project name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HistoryStore {
    projects: BTreeMap<String, ProjectRecord>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(projects: BTreeMap<String, ProjectRecord>) -> Self {
        Self { projects }
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn project(&self, name: &str) -> Option<&ProjectRecord> {
        self.projects.get(name)
    }

    /// Projects in name order.
    pub fn projects(&self) -> impl Iterator<Item = (&str, &ProjectRecord)> {
        self.projects
            .iter()
            .map(|(name, record)| (name.as_str(), record))
    }

    pub fn add_session(&mut self, project: &str, session: Session) -> Result<(), HistoryError> {
        if project.is_empty() {
            return Err(HistoryError::EmptyProject);
        }
        session.validate()?;

        let record = self.projects.entry(project.to_string()).or_default();
        record.sessions.push(session);
        record.recompute_total();
        Ok(())
    }

    pub fn edit_session(
        &mut self,
        project: &str,
        index: usize,
        session: Session,
    ) -> Result<Session, HistoryError> {
        session.validate()?;
        let record = self.record_mut(project)?;
        let len = record.sessions.len();
        let slot = record
            .sessions
            .get_mut(index)
            .ok_or_else(|| HistoryError::SessionIndexOutOfRange {
                project: project.to_string(),
                index,
                len,
            })?;

        let previous = std::mem::replace(slot, session);
        record.recompute_total();
        Ok(previous)
    }

    pub fn delete_session(&mut self, project: &str, index: usize) -> Result<Session, HistoryError> {
        let record = self.record_mut(project)?;
        let len = record.sessions.len();
        if index >= len {
            return Err(HistoryError::SessionIndexOutOfRange {
                project: project.to_string(),
                index,
                len,
            });
        }

        let removed = record.sessions.remove(index);
        if record.sessions.is_empty() {
            self.projects.remove(project);
        } else {
            record.recompute_total();
        }
        Ok(removed)
    }

    /// Sessions whose start lies in `[start, end]`, grouped per project.
    /// Projects without a matching session are left out.
    pub fn query_by_period(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        projects: Option<&[String]>,
    ) -> BTreeMap<String, PeriodTotals> {
        let mut matches = BTreeMap::new();

        for (name, record) in &self.projects {
            if let Some(filter) = projects {
                if !filter.iter().any(|wanted| wanted == name) {
                    continue;
                }
            }

            let sessions = record
                .sessions
                .iter()
                .filter(|session| start <= session.start && session.start <= end)
                .cloned()
                .collect::<Vec<_>>();
            if sessions.is_empty() {
                continue;
            }

            let total_seconds = sum_durations(&sessions);
            matches.insert(
                name.clone(),
                PeriodTotals {
                    sessions,
                    total_seconds,
                },
            );
        }

        matches
    }

    fn record_mut(&mut self, project: &str) -> Result<&mut ProjectRecord, HistoryError> {
        self.projects
            .get_mut(project)
            .ok_or_else(|| HistoryError::ProjectNotFound(project.to_string()))
    }
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// `start` shifted by a fractional number of seconds, at millisecond precision.
pub fn add_seconds(start: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() {
        return None;
    }
    Duration::try_milliseconds(millis as i64).and_then(|offset| start.checked_add_signed(offset))
}

fn sum_durations(sessions: &[Session]) -> f64 {
    sessions.iter().map(|session| session.duration_seconds).sum()
}

fn sanitize_seconds(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

pub fn format_duration(seconds: f64) -> String {
    let total_seconds = sanitize_seconds(seconds).trunc() as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
