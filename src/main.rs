mod checkpoint;
mod clock;
mod config;
mod controller;
mod domain;
mod logging;
mod report;
mod storage;
mod ui;

use std::env;
use std::error::Error;
use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use crate::checkpoint::{CheckpointFile, RecoveryOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::{load_config, log_file_path, resolve_history_path, state_dir};
use crate::controller::SessionController;
use crate::domain::{format_duration, seconds_between, HistoryError, HistoryStore, Session};
use crate::logging::init_logging;
use crate::report::{Period, PeriodPreset, Report};
use crate::storage::HistoryFile;
use crate::ui::run_dashboard;

#[derive(Debug, Parser)]
#[command(name = "punchclock", about = "Clock in and out of projects and report the hours")]
struct Cli {
	/// History file to use instead of the configured one
	#[arg(long)]
	history: Option<PathBuf>,
	/// Start from an empty history when the existing one cannot be read
	#[arg(long)]
	start_empty: bool,
	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Clock in and keep the session running in the dashboard
	Start {
		#[arg(long)]
		project: String,
	},
	/// Close a session left open by an abnormal exit
	Recover,
	Projects,
	Sessions {
		#[arg(long)]
		project: String,
	},
	/// Record a finished session by hand
	Log {
		#[arg(long)]
		project: String,
		#[arg(long)]
		start: String,
		#[arg(long)]
		end: String,
	},
	Edit {
		#[arg(long)]
		project: String,
		/// Session number as listed by `sessions`
		#[arg(long)]
		index: usize,
		#[arg(long)]
		start: String,
		#[arg(long)]
		end: String,
	},
	Delete {
		#[arg(long)]
		project: String,
		#[arg(long)]
		index: usize,
	},
	Report {
		#[command(flatten)]
		period: PeriodArgs,
		#[arg(long = "project")]
		projects: Vec<String>,
		#[arg(long)]
		json: bool,
	},
	/// Write the report structure as JSON for an external renderer
	Export {
		#[arg(long)]
		output: PathBuf,
		#[command(flatten)]
		period: PeriodArgs,
		#[arg(long = "project")]
		projects: Vec<String>,
	},
}

#[derive(Debug, Args)]
struct PeriodArgs {
	/// Today only
	#[arg(long, conflicts_with_all = ["week", "month", "from"])]
	today: bool,
	/// The last seven days through today (default)
	#[arg(long, conflicts_with_all = ["month", "from"])]
	week: bool,
	/// The last thirty days through today
	#[arg(long, conflicts_with = "from")]
	month: bool,
	/// First day of a custom period (YYYY-MM-DD)
	#[arg(long, requires = "to")]
	from: Option<String>,
	/// Last day of a custom period (YYYY-MM-DD)
	#[arg(long, requires = "from")]
	to: Option<String>,
}

impl PeriodArgs {
	fn resolve(&self, now: DateTime<Utc>) -> Result<(Period, &'static str), Box<dyn Error>> {
		if let (Some(from), Some(to)) = (&self.from, &self.to) {
			let period = Period::between_days(parse_day(from)?, parse_day(to)?)?;
			return Ok((period, "Custom"));
		}

		let preset = if self.today {
			PeriodPreset::Today
		} else if self.month {
			PeriodPreset::Month
		} else {
			PeriodPreset::Week
		};
		Ok((Period::preset(preset, now), preset.label()))
	}
}

fn main() {
	if let Err(err) = run() {
		eprintln!("error: {err}");
		std::process::exit(1);
	}
}

fn run() -> Result<(), Box<dyn Error>> {
	let cli = Cli::parse();
	let clock = SystemClock;

	let state_dir = state_dir();
	let config = load_config(&state_dir)?;
	let history_path = resolve_history_path(
		cli.history,
		env::var_os("PUNCHCLOCK_HISTORY"),
		&config,
		&state_dir,
	);

	let log_file = matches!(cli.command, Command::Start { .. }).then(|| log_file_path(&state_dir));
	init_logging(&config.log_level, log_file.as_deref())?;

	let history_file = HistoryFile::new(&history_path);
	let mut history = match history_file.load() {
		Ok(history) => history,
		Err(err) if cli.start_empty => {
			warn!(error = %err, "starting with an empty history");
			let moved_to = history_file.quarantine(clock.now())?;
			eprintln!("warning: {err}");
			eprintln!(
				"warning: unreadable history moved to {}; starting empty",
				moved_to.display()
			);
			HistoryStore::new()
		}
		Err(err) => return Err(err.into()),
	};

	let mut controller = SessionController::new(
		history_file.clone(),
		CheckpointFile::beside(&history_path),
		config.heartbeat_interval(),
	);
	let recovery = controller.recover(&mut history)?;
	let recover_command = matches!(cli.command, Command::Recover);
	print_recovery(&recovery, recover_command);

	match cli.command {
		Command::Start { project } => {
			run_dashboard(&mut controller, &mut history, &project, &clock)?;
		}
		Command::Recover => {}
		Command::Projects => {
			print_projects(&history, &history_file);
		}
		Command::Sessions { project } => {
			print_sessions(&history, &project)?;
		}
		Command::Log {
			project,
			start,
			end,
		} => {
			let project = required_project(&project)?;
			let session = explicit_session(&start, &end)?;
			let duration = session.duration_seconds;
			history.add_session(project, session)?;
			history_file.save(&history)?;
			println!("recorded {} for {project}", format_duration(duration));
		}
		Command::Edit {
			project,
			index,
			start,
			end,
		} => {
			let session = explicit_session(&start, &end)?;
			let duration = session.duration_seconds;
			history.edit_session(&project, position(index)?, session)?;
			history_file.save(&history)?;
			println!(
				"session #{index} of {project} is now {}",
				format_duration(duration)
			);
		}
		Command::Delete { project, index } => {
			let removed = history.delete_session(&project, position(index)?)?;
			history_file.save(&history)?;
			println!(
				"deleted session #{index} of {project} ({})",
				format_duration(removed.duration_seconds)
			);
			if history.project(&project).is_none() {
				println!("{project} has no sessions left and was removed");
			}
		}
		Command::Report {
			period,
			projects,
			json,
		} => {
			let now = clock.now();
			let (period, label) = period.resolve(now)?;
			let report = report::build(&history, period, project_filter(&projects), None, now);
			if json {
				println!("{}", serde_json::to_string_pretty(&report)?);
			} else {
				print_report(&report, label);
			}
		}
		Command::Export {
			output,
			period,
			projects,
		} => {
			let now = clock.now();
			let (period, _) = period.resolve(now)?;
			let report = report::build(&history, period, project_filter(&projects), None, now);
			report.export(&output)?;
			if report.is_empty() {
				println!("{}", empty_notice(&report));
			}
			println!("exported report to {}", output.display());
		}
	}

	Ok(())
}

fn print_recovery(outcome: &RecoveryOutcome, verbose: bool) {
	match outcome {
		RecoveryOutcome::Recovered { project, session } => {
			println!(
				"recovered interrupted session for {project}: {} (up to the last heartbeat)",
				format_duration(session.duration_seconds)
			);
		}
		RecoveryOutcome::AlreadyCommitted { project } => {
			println!("cleared stale checkpoint for {project}; its session was already recorded");
		}
		RecoveryOutcome::Discarded(checkpoint) => {
			println!(
				"discarded unusable checkpoint for {} (no time elapsed before its last heartbeat)",
				checkpoint.project
			);
		}
		RecoveryOutcome::NothingToRecover => {
			if verbose {
				println!("nothing to recover");
			}
		}
	}
}

fn required_project(input: &str) -> Result<&str, HistoryError> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(HistoryError::EmptyProject);
	}
	Ok(trimmed)
}

/// Converts a listed (1-based) session number to an index.
fn position(index: usize) -> Result<usize, Box<dyn Error>> {
	index
		.checked_sub(1)
		.ok_or_else(|| "session numbers start at 1".into())
}

fn explicit_session(start: &str, end: &str) -> Result<Session, Box<dyn Error>> {
	let start = parse_datetime(start)?;
	let end = parse_datetime(end)?;
	let session = Session {
		start,
		end: Some(end),
		duration_seconds: seconds_between(start, end),
	};
	session.validate()?;
	Ok(session)
}

fn project_filter(projects: &[String]) -> Option<&[String]> {
	if projects.is_empty() {
		None
	} else {
		Some(projects)
	}
}

fn parse_datetime(input: &str) -> Result<DateTime<Utc>, Box<dyn Error>> {
	Ok(DateTime::parse_from_rfc3339(input)?.with_timezone(&Utc))
}

fn parse_day(input: &str) -> Result<NaiveDate, Box<dyn Error>> {
	Ok(NaiveDate::parse_from_str(input, "%Y-%m-%d")?)
}

fn print_projects(history: &HistoryStore, history_file: &HistoryFile) {
	if history.is_empty() {
		println!("no projects yet in {}", history_file.path().display());
		return;
	}

	for (name, record) in history.projects() {
		println!(
			"{} | {} | {} sessions",
			format_duration(record.total_seconds()),
			name,
			record.sessions().len()
		);
	}
}

fn print_sessions(history: &HistoryStore, project: &str) -> Result<(), HistoryError> {
	let record = history
		.project(project)
		.ok_or_else(|| HistoryError::ProjectNotFound(project.to_string()))?;

	println!("{project}: {}", format_duration(record.total_seconds()));
	if record.untracked_seconds() > 0.0 {
		println!(
			"   (includes {} recorded before sessions were kept)",
			format_duration(record.untracked_seconds())
		);
	}
	for (index, session) in record.sessions().iter().enumerate() {
		let end = session
			.end
			.map(|end| end.with_timezone(&Local).format("%H:%M").to_string())
			.unwrap_or_else(|| "--:--".to_string());
		println!(
			"{:>3}. {} - {} | {}",
			index + 1,
			session.start.with_timezone(&Local).format("%d/%m/%Y %H:%M"),
			end,
			format_duration(session.duration_seconds)
		);
	}

	Ok(())
}

fn empty_notice(report: &Report) -> String {
	format!("no sessions between {}", report.period.label().replace(" to ", " and "))
}

fn print_report(report: &Report, label: &str) {
	if report.is_empty() {
		println!("{}", empty_notice(report));
		return;
	}

	println!("{label} report | {}", report.period.label());
	println!("grand total: {}", format_duration(report.grand_total_seconds));

	for row in &report.projects {
		println!(
			"\n{} | total {} | today {}",
			row.project,
			format_duration(row.total_seconds),
			format_duration(row.today_seconds)
		);
		for (index, session) in row.sessions.iter().enumerate() {
			println!(
				"{:>3}. {} | {}",
				index + 1,
				session.start.with_timezone(&Local).format("%d/%m/%Y %H:%M"),
				format_duration(session.duration_seconds)
			);
		}
	}
}
