use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointFile, RecoveryError, RecoveryOutcome, recover};
use crate::domain::{HistoryError, HistoryStore, Session, seconds_between};
use crate::storage::{HistoryFile, SaveError};

pub const DEFAULT_HEARTBEAT_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("select an existing project or type a new project name")]
    InvalidProject,
    #[error("a session for {0} is already running; stop it first")]
    AlreadyRunning(String),
    #[error("no session is running")]
    NotRunning,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ActiveSession {
    /// Seconds since start, never negative.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, now).max(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ControllerState {
    #[default]
    Idle,
    Running(ActiveSession),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub elapsed_seconds: f64,
    pub heartbeat_written: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub project: String,
    pub session: Session,
    /// The clock read earlier than the session start; the session was
    /// recorded with zero length.
    pub clock_went_backwards: bool,
}

/// Drives the single active session and hands closed sessions to the history.
#[derive(Debug)]
pub struct SessionController {
    state: ControllerState,
    history_file: HistoryFile,
    checkpoint: CheckpointFile,
    heartbeat_interval: Duration,
}

impl SessionController {
    pub fn new(
        history_file: HistoryFile,
        checkpoint: CheckpointFile,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            state: ControllerState::Idle,
            history_file,
            checkpoint,
            heartbeat_interval,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        match &self.state {
            ControllerState::Running(active) => Some(active),
            ControllerState::Idle => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    /// Startup recovery; must run before the first `start`.
    pub fn recover(&self, history: &mut HistoryStore) -> Result<RecoveryOutcome, RecoveryError> {
        recover(&self.checkpoint, history, &self.history_file)
    }

    pub fn start(
        &mut self,
        project: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let project = project.trim();
        if project.is_empty() {
            return Err(ControllerError::InvalidProject);
        }
        if let Some(active) = self.active() {
            return Err(ControllerError::AlreadyRunning(active.project.clone()));
        }

        self.checkpoint.write(project, now, now)?;
        info!(project, start = %now, "session started");
        self.state = ControllerState::Running(ActiveSession {
            project: project.to_string(),
            started_at: now,
            last_heartbeat: now,
        });
        Ok(())
    }

    /// Refreshes the heartbeat once per interval. Returns `None` while idle.
    /// A failed heartbeat write is reported and retried on the next tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<Tick>, ControllerError> {
        let ControllerState::Running(active) = &mut self.state else {
            return Ok(None);
        };

        let elapsed_seconds = active.elapsed_seconds(now);
        let heartbeat_due = now - active.last_heartbeat >= self.heartbeat_interval;
        if heartbeat_due {
            self.checkpoint
                .write(&active.project, active.started_at, now)?;
            active.last_heartbeat = now;
            debug!(project = %active.project, elapsed_seconds, "heartbeat");
        }

        Ok(Some(Tick {
            elapsed_seconds,
            heartbeat_written: heartbeat_due,
        }))
    }

    /// Commits the running session to `history` and persists it. On a failed
    /// save the history is restored and the session keeps running.
    pub fn stop(
        &mut self,
        now: DateTime<Utc>,
        history: &mut HistoryStore,
    ) -> Result<StopOutcome, ControllerError> {
        let Some(active) = self.active().cloned() else {
            return Err(ControllerError::NotRunning);
        };

        let clock_went_backwards = now < active.started_at;
        if clock_went_backwards {
            warn!(
                project = %active.project,
                start = %active.started_at,
                now = %now,
                "clock moved backwards during session, recording zero duration"
            );
        }
        let session = Session::closed(active.started_at, now);

        let previous = history.clone();
        history.add_session(&active.project, session.clone())?;
        if let Err(err) = self.history_file.save(history) {
            *history = previous;
            return Err(err.into());
        }

        self.state = ControllerState::Idle;
        if let Err(err) = self.checkpoint.clear() {
            // Recovery recognises the committed start and will not double count.
            warn!(error = %err, "session saved but checkpoint not cleared");
        }
        info!(
            project = %active.project,
            seconds = session.duration_seconds,
            "session stopped"
        );

        Ok(StopOutcome {
            project: active.project,
            session,
            clock_went_backwards,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use crate::checkpoint::{CheckpointFile, OpenCheckpoint, RecoveryOutcome};
    use crate::domain::{HistoryStore, Session};
    use crate::storage::HistoryFile;

    use super::{ControllerError, ControllerState, SessionController};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn controller_in(dir: &Path) -> SessionController {
        let history_path = dir.join("history.json");
        SessionController::new(
            HistoryFile::new(&history_path),
            CheckpointFile::beside(&history_path),
            Duration::seconds(60),
        )
    }

    fn checkpoint_in(dir: &Path) -> CheckpointFile {
        CheckpointFile::beside(&dir.join("history.json"))
    }

    #[test]
    fn start_then_stop_commits_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        let mut history = HistoryStore::new();

        controller.start("Acme", at(1000)).unwrap();
        assert!(checkpoint_in(dir.path()).read().is_some());

        let outcome = controller.stop(at(1500), &mut history).unwrap();

        let expected = Session {
            start: at(1000),
            end: Some(at(1500)),
            duration_seconds: 500.0,
        };
        assert_eq!(outcome.session, expected);
        assert!(!outcome.clock_went_backwards);
        assert_eq!(history.project("Acme").unwrap().sessions(), &[expected]);
        assert_eq!(controller.state(), &ControllerState::Idle);
        assert!(!checkpoint_in(dir.path()).path().exists());
        assert_eq!(
            HistoryFile::new(dir.path().join("history.json")).load().unwrap(),
            history
        );
    }

    #[test]
    fn stop_while_idle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        let mut history = HistoryStore::new();
        history
            .add_session("Acme", Session::closed(at(0), at(10)))
            .unwrap();
        let before = history.clone();

        let err = controller.stop(at(20), &mut history).unwrap_err();

        assert!(matches!(err, ControllerError::NotRunning));
        assert_eq!(history, before);
    }

    #[test]
    fn start_requires_a_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());

        assert!(matches!(
            controller.start("   ", at(0)),
            Err(ControllerError::InvalidProject)
        ));
        assert_eq!(controller.state(), &ControllerState::Idle);
        assert_eq!(checkpoint_in(dir.path()).read(), None);
    }

    #[test]
    fn trims_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        controller.start("  Acme \n", at(0)).unwrap();
        assert_eq!(controller.active().unwrap().project, "Acme");
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        controller.start("Acme", at(0)).unwrap();

        let err = controller.start("Beta", at(5)).unwrap_err();

        assert!(matches!(err, ControllerError::AlreadyRunning(ref project) if project == "Acme"));
        assert_eq!(controller.active().unwrap().project, "Acme");
    }

    #[test]
    fn tick_refreshes_heartbeat_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        assert_eq!(controller.tick(at(0)).unwrap(), None);

        controller.start("Acme", at(0)).unwrap();

        let early = controller.tick(at(30)).unwrap().unwrap();
        assert_eq!(early.elapsed_seconds, 30.0);
        assert!(!early.heartbeat_written);

        let due = controller.tick(at(61)).unwrap().unwrap();
        assert!(due.heartbeat_written);
        assert_eq!(
            checkpoint_in(dir.path()).read(),
            Some(OpenCheckpoint {
                project: "Acme".to_string(),
                start: at(0),
                last_heartbeat: at(61),
            })
        );

        let next = controller.tick(at(100)).unwrap().unwrap();
        assert!(!next.heartbeat_written);
        assert_eq!(controller.active().unwrap().last_heartbeat, at(61));
    }

    #[test]
    fn clock_moving_backwards_records_zero_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller_in(dir.path());
        let mut history = HistoryStore::new();
        controller.start("Acme", at(1000)).unwrap();

        let outcome = controller.stop(at(900), &mut history).unwrap();

        assert!(outcome.clock_went_backwards);
        assert_eq!(outcome.session.duration_seconds, 0.0);
        assert_eq!(outcome.session.end, None);
        assert_eq!(history.project("Acme").unwrap().total_seconds(), 0.0);
    }

    #[test]
    fn failed_save_keeps_session_running() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let mut controller = SessionController::new(
            HistoryFile::new(blocker.join("history.json")),
            CheckpointFile::new(dir.path().join("open.checkpoint.json")),
            Duration::seconds(60),
        );
        let mut history = HistoryStore::new();
        controller.start("Acme", at(0)).unwrap();

        let err = controller.stop(at(50), &mut history).unwrap_err();

        assert!(matches!(err, ControllerError::Save(_)));
        assert!(history.is_empty());
        assert!(controller.is_running());
    }

    #[test]
    fn recovery_then_new_session() {
        let dir = tempfile::tempdir().unwrap();
        checkpoint_in(dir.path())
            .write("Acme", at(0), at(120))
            .unwrap();
        let mut controller = controller_in(dir.path());
        let mut history = HistoryStore::new();

        let outcome = controller.recover(&mut history).unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Recovered { .. }));

        controller.start("Acme", at(1000)).unwrap();
        controller.stop(at(1060), &mut history).unwrap();

        let record = history.project("Acme").unwrap();
        assert_eq!(record.sessions().len(), 2);
        assert_eq!(record.total_seconds(), 180.0);
    }
}
