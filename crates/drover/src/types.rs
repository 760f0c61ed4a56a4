use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// When a process that exited on its own should be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
	Always,
	#[default]
	#[serde(alias = "unexpected")]
	OnFailure,
	Never,
}

impl RestartPolicy {
	pub fn permits(&self, exit: &ExitInfo) -> bool {
		match self {
			RestartPolicy::Always => true,
			RestartPolicy::OnFailure => !exit.success(),
			RestartPolicy::Never => false,
		}
	}
}

impl std::fmt::Display for RestartPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RestartPolicy::Always => write!(f, "always"),
			RestartPolicy::OnFailure => write!(f, "on-failure"),
			RestartPolicy::Never => write!(f, "never"),
		}
	}
}

/// Static definition of a managed child process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
	pub name: String,
	pub command: String,
	pub directory: Option<PathBuf>,
	pub environment: BTreeMap<String, String>,
	pub autostart: bool,
	pub autorestart: RestartPolicy,
	/// Consecutive restarts allowed before the process is marked failed for good.
	pub start_retries: u32,
	/// How long a fresh child must stay up before it counts as running.
	pub start_grace: Duration,
	pub stop_timeout: Duration,
	pub depends_on: Vec<String>,
	pub stdout_logfile: PathBuf,
	pub stderr_logfile: PathBuf,
	pub source: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
	Stopped,
	Starting,
	Running,
	Stopping,
	Exited,
	Failed,
	Backoff,
}

impl Phase {
	/// A child process exists for this phase.
	pub fn is_live(&self) -> bool {
		matches!(self, Phase::Starting | Phase::Running | Phase::Stopping)
	}

	pub fn is_running(&self) -> bool {
		matches!(self, Phase::Running)
	}
}

impl std::fmt::Display for Phase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			Phase::Stopped => "stopped",
			Phase::Starting => "starting",
			Phase::Running => "running",
			Phase::Stopping => "stopping",
			Phase::Exited => "exited",
			Phase::Failed => "failed",
			Phase::Backoff => "backoff",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
	pub code: Option<i32>,
	pub signal: Option<i32>,
}

impl ExitInfo {
	pub fn from_status(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}

	pub fn success(&self) -> bool {
		self.code == Some(0)
	}
}

impl std::fmt::Display for ExitInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match (self.code, self.signal) {
			(Some(code), _) => write!(f, "exit {}", code),
			(None, Some(sig)) => write!(f, "signal {}", sig),
			(None, None) => write!(f, "unknown exit"),
		}
	}
}

/// Runtime record of one managed process.
#[derive(Debug, Clone)]
pub struct ProcessState {
	pub phase: Phase,
	pub pid: Option<u32>,
	pub last_exit: Option<ExitInfo>,
	pub restart_count: u32,
	pub retries_exhausted: bool,
	pub last_error: Option<String>,
	pub since: SystemTime,
}

impl Default for ProcessState {
	fn default() -> Self {
		Self {
			phase: Phase::Stopped,
			pid: None,
			last_exit: None,
			restart_count: 0,
			retries_exhausted: false,
			last_error: None,
			since: SystemTime::now(),
		}
	}
}

/// Snapshot of a process for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStatus {
	pub name: String,
	pub phase: Phase,
	pub pid: Option<u32>,
	pub exit_code: Option<i32>,
	pub signal: Option<i32>,
	pub restart_count: u32,
	pub retries_exhausted: bool,
	pub uptime_secs: Option<u64>,
	pub since_unix: u64,
	pub autostart: bool,
	pub autorestart: RestartPolicy,
	pub last_error: Option<String>,
	#[serde(default)]
	pub log_fallback: bool,
}

impl ProcessStatus {
	pub fn is_running(&self) -> bool {
		self.phase.is_running()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
	pub name: String,
	pub from: Phase,
	pub to: Phase,
	pub restart_count: u32,
	pub at_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
	pub added: Vec<String>,
	pub removed: Vec<String>,
	pub changed: Vec<String>,
	pub unchanged: Vec<String>,
}

impl ReloadSummary {
	pub fn is_noop(&self) -> bool {
		self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
	}
}

impl std::fmt::Display for ReloadSummary {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"added: {}, removed: {}, changed: {}, unchanged: {}",
			list_or_dash(&self.added),
			list_or_dash(&self.removed),
			list_or_dash(&self.changed),
			self.unchanged.len()
		)
	}
}

fn list_or_dash(names: &[String]) -> String {
	if names.is_empty() {
		"-".to_string()
	} else {
		names.join(",")
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
	pub forced: bool,
	pub was_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
	pub stopped: Vec<String>,
	pub forced: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
	Stdout,
	Stderr,
}

pub(crate) fn unix_secs(t: SystemTime) -> u64 {
	t.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
	t.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}
