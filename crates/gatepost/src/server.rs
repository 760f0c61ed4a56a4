use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::paths::DaemonPaths;

/// Bind the control socket, replacing a stale socket file left by a previous run.
pub fn bind(paths: &DaemonPaths) -> io::Result<UnixListener> {
	let socket_path = paths.socket_path();
	if let Some(parent) = socket_path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	if socket_path.exists() {
		std::fs::remove_file(&socket_path)?;
	}
	let listener = UnixListener::bind(&socket_path)?;
	tracing::info!("listening on {}", socket_path.display());
	Ok(listener)
}

/// Serve newline-delimited JSON requests until the task is dropped.
///
/// Each line is one `Req`; each reply is one `Resp` line. A line that does not
/// parse is answered with `on_invalid(reason)` and the connection stays open.
pub async fn run_socket_server<Req, Resp, F, Fut, E>(listener: UnixListener, handler: F, on_invalid: E)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let handler = Arc::new(handler);
	let on_invalid = Arc::new(on_invalid);

	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("accept error: {}", e);
				continue;
			}
		};

		let handler = Arc::clone(&handler);
		let on_invalid = Arc::clone(&on_invalid);
		tokio::spawn(async move {
			handle_connection::<Req, Resp, _, _, _>(stream, handler, on_invalid).await;
		});
	}
}

async fn handle_connection<Req, Resp, F, Fut, E>(stream: UnixStream, handler: Arc<F>, on_invalid: Arc<E>)
where
	Req: DeserializeOwned + Send + 'static,
	Resp: Serialize + Send + 'static,
	F: Fn(Req) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Resp> + Send,
	E: Fn(String) -> Resp + Send + Sync + 'static,
{
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		if line.trim().is_empty() {
			continue;
		}

		let response = match serde_json::from_str::<Req>(&line) {
			Ok(request) => handler(request).await,
			Err(e) => {
				tracing::warn!("invalid request: {}", e);
				on_invalid(format!("invalid request: {}", e))
			}
		};

		let mut data = match serde_json::to_vec(&response) {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to serialize response: {}", e);
				continue;
			}
		};
		data.push(b'\n');

		if writer.write_all(&data).await.is_err() {
			break;
		}
	}
}
