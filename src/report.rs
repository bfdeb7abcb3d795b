use std::io;
use std::path::{Path, PathBuf};

use chrono::{
    DateTime, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::controller::ActiveSession;
use crate::domain::{HistoryStore, Session};
use crate::storage::write_atomically;

const WEEK_DAYS: i64 = 7;
const MONTH_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid period: {from} is after {to}")]
    InvalidPeriod { from: NaiveDate, to: NaiveDate },
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write report {}: {source}", .path.display())]
    Export { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPreset {
    Today,
    Week,
    Month,
}

impl PeriodPreset {
    pub fn label(self) -> &'static str {
        match self {
            PeriodPreset::Today => "Today",
            PeriodPreset::Week => "Weekly",
            PeriodPreset::Month => "Monthly",
        }
    }

    pub fn next(self) -> Self {
        match self {
            PeriodPreset::Today => PeriodPreset::Week,
            PeriodPreset::Week => PeriodPreset::Month,
            PeriodPreset::Month => PeriodPreset::Today,
        }
    }
}

/// Inclusive time range over session start timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn preset(preset: PeriodPreset, now: DateTime<Utc>) -> Self {
        match preset {
            PeriodPreset::Today => Self::last_days(0, now),
            PeriodPreset::Week => Self::last_days(WEEK_DAYS, now),
            PeriodPreset::Month => Self::last_days(MONTH_DAYS, now),
        }
    }

    /// From local midnight `days` days ago through the end of today.
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        let today = local_day(now);
        let first = today - Duration::days(days);
        Self {
            start: local_day_start(first),
            end: local_day_end(today),
        }
    }

    pub fn between_days(from: NaiveDate, to: NaiveDate) -> Result<Self, ReportError> {
        if from > to {
            return Err(ReportError::InvalidPeriod { from, to });
        }

        Ok(Self {
            start: local_day_start(from),
            end: local_day_end(to),
        })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    pub fn label(&self) -> String {
        format!(
            "{} to {}",
            self.start.with_timezone(&Local).format("%d/%m/%Y"),
            self.end.with_timezone(&Local).format("%d/%m/%Y")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectReport {
    pub project: String,
    pub total_seconds: f64,
    /// Completed time started today plus any live time for this project.
    pub today_seconds: f64,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSession {
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

/// Aggregated view handed to whatever renders or exports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub period: Period,
    pub projects: Vec<ProjectReport>,
    pub grand_total_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveSession>,
}

impl Report {
    /// No completed session matched the period and project filter.
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn export(&self, path: &Path) -> Result<(), ReportError> {
        let mut encoded = serde_json::to_string_pretty(self)?;
        encoded.push('\n');
        write_atomically(path, encoded.as_bytes()).map_err(|source| ReportError::Export {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), projects = self.projects.len(), "report exported");
        Ok(())
    }
}

pub fn build(
    history: &HistoryStore,
    period: Period,
    projects: Option<&[String]>,
    running: Option<&ActiveSession>,
    now: DateTime<Utc>,
) -> Report {
    let today = local_day(now);
    let live = running
        .filter(|active| {
            projects
                .map(|filter| filter.iter().any(|wanted| *wanted == active.project))
                .unwrap_or(true)
        })
        .map(|active| LiveSession {
            project: active.project.clone(),
            started_at: active.started_at,
            elapsed_seconds: active.elapsed_seconds(now),
        });

    let mut rows = Vec::new();
    for (project, totals) in history.query_by_period(period.start, period.end, projects) {
        let mut sessions = totals.sessions;
        sessions.sort_by_key(|session| session.start);

        let mut today_seconds: f64 = sessions
            .iter()
            .filter(|session| local_day(session.start) == today)
            .map(|session| session.duration_seconds)
            .sum();
        if let Some(live) = live
            .as_ref()
            .filter(|live| live.project == project && period.contains(now))
        {
            today_seconds += live.elapsed_seconds;
        }

        rows.push(ProjectReport {
            project,
            total_seconds: totals.total_seconds,
            today_seconds,
            sessions,
        });
    }

    let grand_total_seconds = rows.iter().map(|row| row.total_seconds).sum();
    Report {
        period,
        projects: rows,
        grand_total_seconds,
        live,
    }
}

pub fn local_day(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.with_timezone(&Local).date_naive()
}

fn local_day_start(day: NaiveDate) -> DateTime<Utc> {
    local_naive_to_utc_resolved(day.and_time(NaiveTime::MIN))
}

fn local_day_end(day: NaiveDate) -> DateTime<Utc> {
    let next = day.succ_opt().unwrap_or(day);
    local_day_start(next) - Duration::microseconds(1)
}

fn local_naive_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(local_datetime) => Some(local_datetime.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, second) => Some(first.min(second).with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Midnight can fall inside a DST gap; walk forward to the first valid minute.
pub fn local_naive_to_utc_resolved(naive: NaiveDateTime) -> DateTime<Utc> {
    let mut cursor = naive;
    for _ in 0..=120 {
        if let Some(timestamp) = local_naive_to_utc(cursor) {
            return timestamp;
        }
        cursor += Duration::minutes(1);
    }

    Utc.from_utc_datetime(&naive)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use crate::controller::ActiveSession;
    use crate::domain::{HistoryStore, Session};

    use super::{Period, PeriodPreset, ReportError, build, local_day};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn sample_history(now: DateTime<Utc>) -> HistoryStore {
        let mut history = HistoryStore::new();
        let three_days_ago = now - Duration::days(3);
        history
            .add_session(
                "Beta",
                Session::closed(three_days_ago, three_days_ago + Duration::minutes(30)),
            )
            .unwrap();
        history
            .add_session("Acme", Session::closed(now, now + Duration::minutes(10)))
            .unwrap();
        history
            .add_session(
                "Acme",
                Session::closed(three_days_ago, three_days_ago + Duration::hours(1)),
            )
            .unwrap();
        history
    }

    #[test]
    fn sums_per_project_and_overall() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let history = sample_history(now);
        let period = Period {
            start: now - Duration::days(7),
            end: now + Duration::hours(1),
        };

        let report = build(&history, period, None, None, now);

        let names = report
            .projects
            .iter()
            .map(|row| row.project.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Acme", "Beta"]);
        assert_eq!(report.projects[0].total_seconds, 4200.0);
        assert_eq!(report.projects[0].today_seconds, 600.0);
        assert_eq!(report.projects[1].today_seconds, 0.0);
        assert_eq!(report.grand_total_seconds, 6000.0);
        assert!(report.live.is_none());

        let starts = report.projects[0]
            .sessions
            .iter()
            .map(|session| session.start)
            .collect::<Vec<_>>();
        assert_eq!(starts, vec![now - Duration::days(3), now]);
    }

    #[test]
    fn live_time_only_lands_in_today_figure() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let history = sample_history(now);
        let running = ActiveSession {
            project: "Acme".to_string(),
            started_at: now - Duration::minutes(5),
            last_heartbeat: now - Duration::minutes(1),
        };
        let period = Period {
            start: now - Duration::days(7),
            end: now + Duration::hours(1),
        };

        let report = build(&history, period, None, Some(&running), now);

        let acme = &report.projects[0];
        assert_eq!(acme.total_seconds, 4200.0);
        assert_eq!(acme.today_seconds, 900.0);
        assert_eq!(report.grand_total_seconds, 6000.0);
        assert_eq!(report.live.as_ref().unwrap().elapsed_seconds, 300.0);
    }

    #[test]
    fn live_time_skipped_when_period_is_in_the_past() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let mut history = HistoryStore::new();
        let earlier = now - Duration::days(10);
        history
            .add_session("Acme", Session::closed(earlier, earlier + Duration::minutes(10)))
            .unwrap();
        let running = ActiveSession {
            project: "Acme".to_string(),
            started_at: now - Duration::minutes(5),
            last_heartbeat: now,
        };
        let period = Period {
            start: now - Duration::days(14),
            end: now - Duration::days(7),
        };

        let report = build(&history, period, None, Some(&running), now);

        assert_eq!(report.projects[0].total_seconds, 600.0);
        assert_eq!(report.projects[0].today_seconds, 0.0);
    }

    #[test]
    fn live_session_outside_filter_is_ignored() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let history = sample_history(now);
        let running = ActiveSession {
            project: "Acme".to_string(),
            started_at: now - Duration::minutes(5),
            last_heartbeat: now,
        };
        let period = Period {
            start: now - Duration::days(7),
            end: now,
        };
        let filter = vec!["Beta".to_string()];

        let report = build(&history, period, Some(&filter), Some(&running), now);

        assert_eq!(report.projects.len(), 1);
        assert_eq!(report.projects[0].project, "Beta");
        assert!(report.live.is_none());
    }

    #[test]
    fn empty_period_is_marked_not_failed() {
        let history = sample_history(at(1_000_000));
        let period = Period {
            start: at(0),
            end: at(10),
        };

        let report = build(&history, period, None, None, at(1_000_000));

        assert!(report.is_empty());
        assert_eq!(report.grand_total_seconds, 0.0);
    }

    #[test]
    fn presets_cover_whole_local_days() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();

        let week = Period::preset(PeriodPreset::Week, now);
        assert_eq!(local_day(week.start), local_day(now) - Duration::days(7));
        assert_eq!(local_day(week.end), local_day(now));
        assert!(week.start <= now && now <= week.end);

        let today = Period::preset(PeriodPreset::Today, now);
        assert_eq!(local_day(today.start), local_day(now));
        assert_eq!(today.end - today.start, Duration::days(1) - Duration::microseconds(1));

        let month = Period::preset(PeriodPreset::Month, now);
        assert_eq!(local_day(month.start), local_day(now) - Duration::days(30));
    }

    #[test]
    fn custom_period_rejects_reversed_days() {
        let from = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(matches!(
            Period::between_days(from, to),
            Err(ReportError::InvalidPeriod { .. })
        ));

        let single = Period::between_days(to, to).unwrap();
        assert_eq!(local_day(single.start), to);
        assert_eq!(local_day(single.end), to);
    }

    #[test]
    fn cycles_presets() {
        assert_eq!(PeriodPreset::Today.next(), PeriodPreset::Week);
        assert_eq!(PeriodPreset::Month.next(), PeriodPreset::Today);
    }

    #[test]
    fn exports_report_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("week.json");
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let history = sample_history(now);
        let report = build(&history, Period::preset(PeriodPreset::Week, now), None, None, now);

        report.export(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["grand_total_seconds"], serde_json::json!(6000.0));
        assert_eq!(value["projects"][0]["project"], "Acme");
        assert!(value.get("live").is_none());
    }
}
