use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::controller::DEFAULT_HEARTBEAT_SECS;

const APP_DIR: &str = "punchclock";
const CONFIG_FILE: &str = "config.toml";
const HISTORY_FILE: &str = "history.json";
const LOG_FILE: &str = "punchclock.log";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {}: {source}", .path.display())]
	Read { path: PathBuf, source: io::Error },
	#[error("failed to parse config {}: {source}", .path.display())]
	Parse {
		path: PathBuf,
		source: toml::de::Error,
	},
	#[error("heartbeat_interval_secs must be at least 1")]
	InvalidHeartbeat,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub history_path: Option<PathBuf>,
	pub heartbeat_interval_secs: i64,
	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			history_path: None,
			heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
			log_level: "warn".to_string(),
		}
	}
}

impl Config {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::seconds(self.heartbeat_interval_secs)
	}
}

/// Reads `config.toml` from the state directory; a missing file means defaults.
pub fn load_config(state_dir: &Path) -> Result<Config, ConfigError> {
	let path = state_dir.join(CONFIG_FILE);
	let raw = match fs::read_to_string(&path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
		Err(source) => return Err(ConfigError::Read { path, source }),
	};

	let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
		path: path.clone(),
		source,
	})?;
	if config.heartbeat_interval_secs < 1 {
		return Err(ConfigError::InvalidHeartbeat);
	}

	Ok(config)
}

/// `--history` wins, then `PUNCHCLOCK_HISTORY`, then the config file, then
/// `history.json` in the state directory.
pub fn resolve_history_path(
	cli_path: Option<PathBuf>,
	env_path: Option<OsString>,
	config: &Config,
	state_dir: &Path,
) -> PathBuf {
	if let Some(path) = cli_path {
		return absolutize(path);
	}

	if let Some(path) = env_path {
		let path = PathBuf::from(path);
		if !path.as_os_str().is_empty() {
			return absolutize(path);
		}
	}

	if let Some(path) = &config.history_path {
		if path.is_relative() {
			return state_dir.join(path);
		}
		return path.clone();
	}

	state_dir.join(HISTORY_FILE)
}

pub fn log_file_path(state_dir: &Path) -> PathBuf {
	state_dir.join(LOG_FILE)
}

pub fn state_dir() -> PathBuf {
	if let Some(path) = env::var_os("PUNCHCLOCK_STATE_DIR") {
		return PathBuf::from(path);
	}

	#[cfg(target_os = "windows")]
	{
		if let Some(path) = env::var_os("LOCALAPPDATA") {
			return PathBuf::from(path).join(APP_DIR);
		}
	}

	if let Some(path) = env::var_os("XDG_STATE_HOME") {
		return PathBuf::from(path).join(APP_DIR);
	}

	if let Some(path) = env::var_os("HOME") {
		return PathBuf::from(path).join(".local").join("state").join(APP_DIR);
	}

	PathBuf::from(format!(".{APP_DIR}"))
}

fn absolutize(path: PathBuf) -> PathBuf {
	if path.is_absolute() {
		return path;
	}

	match env::current_dir() {
		Ok(cwd) => cwd.join(path),
		Err(_) => path,
	}
}

#[cfg(test)]
mod tests {
	use std::ffi::OsString;
	use std::fs;
	use std::path::{Path, PathBuf};

	use pretty_assertions::assert_eq;

	use super::{Config, ConfigError, load_config, resolve_history_path};

	#[test]
	fn missing_config_uses_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let config = load_config(dir.path()).unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.heartbeat_interval(), chrono::Duration::seconds(60));
	}

	#[test]
	fn reads_partial_config() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(
			dir.path().join("config.toml"),
			"heartbeat_interval_secs = 15\nlog_level = \"debug\"\n",
		)
		.unwrap();

		let config = load_config(dir.path()).unwrap();
		assert_eq!(config.heartbeat_interval_secs, 15);
		assert_eq!(config.log_level, "debug");
		assert_eq!(config.history_path, None);
	}

	#[test]
	fn rejects_zero_heartbeat_and_unknown_keys() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join("config.toml"), "heartbeat_interval_secs = 0\n").unwrap();
		assert!(matches!(load_config(dir.path()), Err(ConfigError::InvalidHeartbeat)));

		fs::write(dir.path().join("config.toml"), "heartbeat = 5\n").unwrap();
		assert!(matches!(load_config(dir.path()), Err(ConfigError::Parse { .. })));
	}

	#[test]
	fn history_path_precedence() {
		let state_dir = Path::new("/state");
		let config = Config {
			history_path: Some(PathBuf::from("work/hours.json")),
			..Config::default()
		};

		assert_eq!(
			resolve_history_path(
				Some(PathBuf::from("/cli/history.json")),
				Some(OsString::from("/env/history.json")),
				&config,
				state_dir,
			),
			PathBuf::from("/cli/history.json")
		);
		assert_eq!(
			resolve_history_path(None, Some(OsString::from("/env/history.json")), &config, state_dir),
			PathBuf::from("/env/history.json")
		);
		assert_eq!(
			resolve_history_path(None, Some(OsString::new()), &config, state_dir),
			PathBuf::from("/state/work/hours.json")
		);
		assert_eq!(
			resolve_history_path(None, None, &Config::default(), state_dir),
			PathBuf::from("/state/history.json")
		);
	}
}
