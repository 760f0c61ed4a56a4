use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct DaemonPaths {
	pub app_name: String,
	socket: Option<PathBuf>,
}

impl DaemonPaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self {
			app_name: app_name.into(),
			socket: None,
		}
	}

	/// Put the socket somewhere other than the state directory. The PID file
	/// follows it.
	pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
		self.socket = Some(socket.into());
		self
	}

	pub fn state_dir(&self) -> PathBuf {
		if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
			PathBuf::from(dir).join(&self.app_name)
		} else if let Some(home) = home_dir() {
			home.join(".local").join("state").join(&self.app_name)
		} else {
			PathBuf::from("/tmp").join(&self.app_name)
		}
	}

	pub fn config_dir(&self) -> PathBuf {
		if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
			PathBuf::from(dir).join(&self.app_name)
		} else if let Some(home) = home_dir() {
			home.join(".config").join(&self.app_name)
		} else {
			PathBuf::from("/tmp").join(&self.app_name).join("config")
		}
	}

	pub fn socket_path(&self) -> PathBuf {
		match &self.socket {
			Some(path) => path.clone(),
			None => self.state_dir().join("daemon.sock"),
		}
	}

	/// `daemon.sock` -> `daemon.pid`, in the same directory.
	pub fn pid_path(&self) -> PathBuf {
		self.socket_path().with_extension("pid")
	}

	/// Directory holding the socket and PID file.
	pub fn runtime_dir(&self) -> PathBuf {
		self.socket_path()
			.parent()
			.map(|p| p.to_path_buf())
			.unwrap_or_else(|| self.state_dir())
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}
