use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::unix::net::UnixStream;

use serde::{de::DeserializeOwned, Serialize};

use crate::paths::DaemonPaths;

/// Errors from daemon client operations.
#[derive(Debug)]
pub enum ClientError {
	/// Daemon is not running (socket not found or refusing connections).
	NotRunning,
	/// IO error during communication.
	Io(io::Error),
	Serialize(String),
	Deserialize(String),
	/// The daemon closed the connection without answering.
	Closed,
}

impl std::fmt::Display for ClientError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ClientError::NotRunning => write!(f, "daemon not running"),
			ClientError::Io(e) => write!(f, "io error: {}", e),
			ClientError::Serialize(e) => write!(f, "serialize error: {}", e),
			ClientError::Deserialize(e) => write!(f, "deserialize error: {}", e),
			ClientError::Closed => write!(f, "daemon closed the connection"),
		}
	}
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
	fn from(e: io::Error) -> Self {
		ClientError::Io(e)
	}
}

/// Blocking client for the daemon's control socket.
pub struct DaemonClient<Req, Resp> {
	reader: BufReader<UnixStream>,
	_phantom: PhantomData<(Req, Resp)>,
}

impl<Req, Resp> DaemonClient<Req, Resp>
where
	Req: Serialize,
	Resp: DeserializeOwned,
{
	/// Connect to an already-running daemon.
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		Ok(Self {
			reader: BufReader::new(stream),
			_phantom: PhantomData,
		})
	}

	/// Send a request and wait for its response.
	pub fn send(&mut self, request: &Req) -> Result<Resp, ClientError> {
		let mut data = serde_json::to_vec(request).map_err(|e| ClientError::Serialize(e.to_string()))?;
		data.push(b'\n');
		self.reader.get_mut().write_all(&data)?;

		let mut line = String::new();
		if self.reader.read_line(&mut line)? == 0 {
			return Err(ClientError::Closed);
		}

		serde_json::from_str(&line).map_err(|e| ClientError::Deserialize(e.to_string()))
	}
}

/// Check if a daemon is running (socket is connectable).
pub fn is_running(paths: &DaemonPaths) -> bool {
	UnixStream::connect(paths.socket_path()).is_ok()
}

/// Read the PID of a running daemon from its PID file.
pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}
