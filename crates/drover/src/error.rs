use std::path::PathBuf;

use crate::types::ExitInfo;

/// Errors surfaced by the supervisor.
///
/// Per-process variants are recorded on that process only; `Config` is the one
/// that stops the supervisor from starting.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorError {
	/// Malformed or conflicting program definitions.
	Config { path: Option<PathBuf>, message: String },
	/// The child could not be spawned.
	Launch { name: String, message: String },
	/// The child exited before it became ready.
	Crashed { name: String, exit: ExitInfo },
	/// The restart budget is spent; the process stays failed.
	RetryExhausted { name: String, restarts: u32 },
	/// The control socket could not be served.
	ControlChannel(String),
	/// No program with that name.
	NotFound(String),
	/// The supervisor is draining its children.
	ShuttingDown,
	/// The process was stopped before it became ready.
	Interrupted(String),
}

impl SupervisorError {
	pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
		SupervisorError::Config {
			path: Some(path.into()),
			message: message.into(),
		}
	}
}

impl std::fmt::Display for SupervisorError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SupervisorError::Config { path: Some(path), message } => {
				write!(f, "config error in {}: {}", path.display(), message)
			}
			SupervisorError::Config { path: None, message } => write!(f, "config error: {}", message),
			SupervisorError::Launch { name, message } => write!(f, "{}: launch failed: {}", name, message),
			SupervisorError::Crashed { name, exit } => write!(f, "{}: crashed ({})", name, exit),
			SupervisorError::RetryExhausted { name, restarts } => {
				write!(f, "{}: gave up after {} restarts", name, restarts)
			}
			SupervisorError::ControlChannel(e) => write!(f, "control channel error: {}", e),
			SupervisorError::NotFound(name) => write!(f, "{}: no such program", name),
			SupervisorError::ShuttingDown => write!(f, "supervisor is shutting down"),
			SupervisorError::Interrupted(name) => write!(f, "{}: stopped before it became ready", name),
		}
	}
}

impl std::error::Error for SupervisorError {}
