use std::io;

use crate::client;
use crate::paths::DaemonPaths;

/// PID file and socket ownership for a daemon running in the foreground.
pub struct Daemon {
	pub paths: DaemonPaths,
}

impl Daemon {
	pub fn new(paths: DaemonPaths) -> Self {
		Self { paths }
	}

	/// Claim the runtime directory: refuse if another daemon answers on the
	/// socket, otherwise write our PID. A stale socket file is left for
	/// [`crate::server::bind`] to replace.
	pub fn prepare(&self) -> io::Result<()> {
		if client::is_running(&self.paths) {
			return Err(io::Error::new(
				io::ErrorKind::AddrInUse,
				format!("a daemon is already listening on {}", self.paths.socket_path().display()),
			));
		}

		std::fs::create_dir_all(self.paths.runtime_dir())?;
		std::fs::write(self.paths.pid_path(), format!("{}\n", std::process::id()))?;
		tracing::info!("daemon started (pid {})", std::process::id());
		Ok(())
	}

	/// Remove the socket and PID file, but only if the PID file is still ours.
	pub fn cleanup(&self) {
		if client::read_pid(&self.paths).is_some_and(|pid| pid != std::process::id()) {
			return;
		}
		let _ = std::fs::remove_file(self.paths.socket_path());
		let _ = std::fs::remove_file(self.paths.pid_path());
	}

	/// Ask a running daemon to shut down via SIGTERM. Returns its PID.
	pub fn stop(&self) -> Result<u32, String> {
		let Some(pid) = client::read_pid(&self.paths) else {
			return Err("daemon not running".to_string());
		};

		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;
		kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| format!("failed to signal pid {}: {}", pid, e))?;
		Ok(pid)
	}
}
