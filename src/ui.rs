use std::error::Error;
use std::io;
use std::time::Duration as StdDuration;

use crossterm::event::{self, Event as CEvent, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, ExecutableCommand};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};
use ratatui::{Frame, Terminal};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::controller::{ControllerError, ControllerState, SessionController};
use crate::domain::{format_duration, HistoryStore};
use crate::report::{self, Period, PeriodPreset, Report};

const TICK_RATE: StdDuration = StdDuration::from_millis(250);
const RUNNING_COLOR: Color = Color::LightGreen;
const IDLE_COLOR: Color = Color::DarkGray;
const PANEL_BORDER_COLOR: Color = Color::Yellow;

/// Runs `project` in the foreground until the user stops and quits.
pub fn run_dashboard(
	controller: &mut SessionController,
	history: &mut HistoryStore,
	project: &str,
	clock: &dyn Clock,
) -> Result<(), Box<dyn Error>> {
	let mut dashboard = Dashboard::new(controller, history, clock, project);
	dashboard.start()?;

	enable_raw_mode()?;
	let mut stdout = io::stdout();
	stdout.execute(EnterAlternateScreen)?;
	let backend = CrosstermBackend::new(stdout);
	let mut terminal = Terminal::new(backend)?;

	let result = run_event_loop(&mut terminal, &mut dashboard);
	if let Err(err) = &result {
		dashboard.close_after_failure(err.as_ref());
	}

	disable_raw_mode()?;
	execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
	terminal.show_cursor()?;

	if let Some(message) = dashboard.last_commit.take() {
		println!("{message}");
	}
	result
}

fn run_event_loop(
	terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
	dashboard: &mut Dashboard<'_>,
) -> Result<(), Box<dyn Error>> {
	loop {
		dashboard.on_tick();
		let view = dashboard.view();
		terminal.draw(|frame| draw_dashboard(frame, &*dashboard, &view))?;

		if event::poll(TICK_RATE)? {
			if let CEvent::Key(key) = event::read()? {
				if key.kind != KeyEventKind::Press {
					continue;
				}

				if dashboard.handle_key(key.code, key.modifiers) {
					break;
				}
			}
		}
	}

	Ok(())
}

struct Dashboard<'a> {
	controller: &'a mut SessionController,
	history: &'a mut HistoryStore,
	clock: &'a dyn Clock,
	project: String,
	period: PeriodPreset,
	elapsed_seconds: f64,
	status: String,
	last_commit: Option<String>,
}

struct ViewModel {
	running: bool,
	totals: Vec<(String, f64)>,
	report: Report,
}

impl<'a> Dashboard<'a> {
	fn new(
		controller: &'a mut SessionController,
		history: &'a mut HistoryStore,
		clock: &'a dyn Clock,
		project: &str,
	) -> Self {
		Self {
			controller,
			history,
			clock,
			project: project.trim().to_string(),
			period: PeriodPreset::Today,
			elapsed_seconds: 0.0,
			status: String::new(),
			last_commit: None,
		}
	}

	fn start(&mut self) -> Result<(), ControllerError> {
		self.controller.start(&self.project, self.clock.now())?;
		self.elapsed_seconds = 0.0;
		self.status = format!("Tracking {}", self.project);
		Ok(())
	}

	fn on_tick(&mut self) {
		match self.controller.tick(self.clock.now()) {
			Ok(Some(tick)) => {
				self.elapsed_seconds = tick.elapsed_seconds;
				if tick.heartbeat_written {
					debug!(project = %self.project, "checkpoint refreshed");
				}
			}
			Ok(None) => {}
			Err(err) => {
				warn!(error = %err, "heartbeat failed");
				self.status = format!("warning: {err}");
			}
		}
	}

	fn stop(&mut self) {
		match self.controller.stop(self.clock.now(), self.history) {
			Ok(outcome) => {
				let mut message = format!(
					"Recorded {} for '{}'",
					format_duration(outcome.session.duration_seconds),
					outcome.project
				);
				if outcome.clock_went_backwards {
					message.push_str(" (clock moved backwards, recorded as zero)");
				}
				self.elapsed_seconds = 0.0;
				self.status = message.clone();
				self.last_commit = Some(message);
			}
			Err(err) => self.status = format!("error: {err}"),
		}
	}

	/// Returns true when the dashboard should close.
	fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> bool {
		let interrupt = code == KeyCode::Char('c') && modifiers.contains(KeyModifiers::CONTROL);
		match code {
			_ if interrupt => self.stop_and_quit(),
			KeyCode::Char('q') | KeyCode::Esc => self.stop_and_quit(),
			KeyCode::Char('s') => {
				if self.controller.is_running() {
					self.stop();
				} else {
					self.status = "Nothing is running; Enter starts a new session".to_string();
				}
				false
			}
			KeyCode::Enter => {
				if let Err(err) = self.start() {
					self.status = format!("error: {err}");
				}
				false
			}
			KeyCode::Char('r') => {
				self.period = self.period.next();
				self.status = format!("Showing {} report", self.period.label().to_lowercase());
				false
			}
			_ => false,
		}
	}

	/// A failed stop keeps the dashboard open so the session is not lost.
	fn stop_and_quit(&mut self) -> bool {
		if self.controller.is_running() {
			self.stop();
		}
		!self.controller.is_running()
	}

	/// Commits the running session when the dashboard dies, so nothing since
	/// the last heartbeat is lost.
	fn close_after_failure(&mut self, err: &dyn Error) {
		if !self.controller.is_running() {
			return;
		}
		warn!(error = %err, project = %self.project, "dashboard failed; stopping the running session");
		self.stop();
	}

	fn view(&self) -> ViewModel {
		let now = self.clock.now();
		let totals = self
			.history
			.projects()
			.map(|(name, record)| (name.to_string(), record.total_seconds()))
			.collect();
		let report = report::build(
			&*self.history,
			Period::preset(self.period, now),
			None,
			self.controller.active(),
			now,
		);

		ViewModel {
			running: matches!(self.controller.state(), ControllerState::Running(_)),
			totals,
			report,
		}
	}
}

fn draw_dashboard(frame: &mut Frame, dashboard: &Dashboard<'_>, view: &ViewModel) {
	let layout = Layout::default()
		.direction(Direction::Vertical)
		.constraints([Constraint::Length(5), Constraint::Min(8), Constraint::Length(4)])
		.split(frame.area());

	let body = Layout::default()
		.direction(Direction::Horizontal)
		.constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
		.split(layout[1]);

	render_timer_panel(frame, layout[0], dashboard, view);
	render_totals_panel(frame, body[0], view);
	render_report_panel(frame, body[1], dashboard.period, &view.report);
	render_footer(frame, layout[2], dashboard);
}

fn render_timer_panel(frame: &mut Frame, area: Rect, dashboard: &Dashboard<'_>, view: &ViewModel) {
	let (state, color) = if view.running {
		("running", RUNNING_COLOR)
	} else {
		("stopped", IDLE_COLOR)
	};
	let lines = vec![
		Line::from(Span::styled(
			format_duration(dashboard.elapsed_seconds),
			Style::default().fg(color).add_modifier(Modifier::BOLD),
		)),
		Line::from(format!("{} | {state}", dashboard.project)),
	];

	let block = Block::default()
		.borders(Borders::ALL)
		.title("Session")
		.border_style(Style::default().fg(PANEL_BORDER_COLOR));
	frame.render_widget(Paragraph::new(lines).alignment(Alignment::Center).block(block), area);
}

fn render_totals_panel(frame: &mut Frame, area: Rect, view: &ViewModel) {
	let items = if view.totals.is_empty() {
		vec![ListItem::new("(no projects yet)")]
	} else {
		view.totals
			.iter()
			.map(|(name, total)| ListItem::new(format!("{} | {name}", format_duration(*total))))
			.collect()
	};

	let block = Block::default().borders(Borders::ALL).title("Projects");
	frame.render_widget(List::new(items).block(block), area);
}

fn render_report_panel(frame: &mut Frame, area: Rect, period: PeriodPreset, report: &Report) {
	let mut lines = vec![
		Line::from(report.period.label()),
		Line::from(Span::styled(
			format!("Grand total: {}", format_duration(report.grand_total_seconds)),
			Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
		)),
		Line::from(""),
	];

	if report.is_empty() {
		lines.push(Line::from("No sessions in this period"));
	}

	for row in &report.projects {
		lines.push(Line::from(Span::styled(
			row.project.clone(),
			Style::default().add_modifier(Modifier::BOLD),
		)));
		lines.push(Line::from(format!(
			"  total {} | today {}",
			format_duration(row.total_seconds),
			format_duration(row.today_seconds)
		)));
	}

	if let Some(live) = &report.live {
		lines.push(Line::from(""));
		lines.push(Line::from(format!(
			"live: {} +{}",
			live.project,
			format_duration(live.elapsed_seconds)
		)));
	}

	let block = Block::default()
		.borders(Borders::ALL)
		.title(format!("{} report", period.label()));
	frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_footer(frame: &mut Frame, area: Rect, dashboard: &Dashboard<'_>) {
	let lines = vec![
		Line::from("s stop | Enter start again | r cycle report period | q stop and quit"),
		Line::from(dashboard.status.clone()),
	];
	let footer = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Shortcuts"));
	frame.render_widget(footer, area);
}
