use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use drover::{logs, ProcessStatus, ReloadSummary, Stream, SupervisorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::daemon::{Action, DaemonState};

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: Arc<DaemonState>) -> Router {
	Router::new()
		.route("/api/processes", get(list_processes))
		.route("/api/processes/{name}", get(process_detail))
		.route("/api/processes/{name}/logs", get(process_logs))
		.route("/api/processes/{name}/start", post(start_process))
		.route("/api/processes/{name}/stop", post(stop_process))
		.route("/api/processes/{name}/restart", post(restart_process))
		.route("/api/reload", post(reload))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize)]
struct ActionResponse {
	message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

#[derive(Deserialize)]
struct LogsQuery {
	#[serde(default)]
	stderr: bool,
	lines: Option<usize>,
}

fn api_error(err: SupervisorError) -> ApiError {
	let status = match &err {
		SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
		SupervisorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
		SupervisorError::Config { .. } => StatusCode::UNPROCESSABLE_ENTITY,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	(status, Json(ErrorResponse { error: err.to_string() }))
}

async fn list_processes(State(state): State<Arc<DaemonState>>) -> Json<Vec<ProcessStatus>> {
	Json(state.supervisor.status().await)
}

async fn process_detail(
	State(state): State<Arc<DaemonState>>,
	Path(name): Path<String>,
) -> Result<Json<ProcessStatus>, ApiError> {
	state
		.supervisor
		.process_status(&name)
		.await
		.map(Json)
		.ok_or_else(|| api_error(SupervisorError::NotFound(name)))
}

async fn process_logs(
	State(state): State<Arc<DaemonState>>,
	Path(name): Path<String>,
	Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
	let stream = if query.stderr { Stream::Stderr } else { Stream::Stdout };
	let capture = state.supervisor.output(&name, stream).await.map_err(api_error)?;
	let snapshot = capture.snapshot().await;
	let text = String::from_utf8_lossy(&snapshot);
	Ok(match query.lines {
		Some(n) => logs::tail_lines(&text, n),
		None => text.into_owned(),
	})
}

async fn act(state: &DaemonState, action: Action, name: &str) -> Result<Json<ActionResponse>, ApiError> {
	state
		.act(action, name, None)
		.await
		.map(|message| Json(ActionResponse { message }))
		.map_err(api_error)
}

async fn start_process(
	State(state): State<Arc<DaemonState>>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	act(&state, Action::Start, &name).await
}

async fn stop_process(
	State(state): State<Arc<DaemonState>>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	act(&state, Action::Stop, &name).await
}

async fn restart_process(
	State(state): State<Arc<DaemonState>>,
	Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
	act(&state, Action::Restart, &name).await
}

async fn reload(State(state): State<Arc<DaemonState>>) -> Result<Json<ReloadSummary>, ApiError> {
	state.reload().await.map(Json).map_err(api_error)
}

#[cfg(test)]
mod tests {
	use super::*;
	use drover::{Defaults, Supervisor, SupervisorConfig};
	use std::time::Duration;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	async fn serve(name: &str) -> (std::net::SocketAddr, Arc<DaemonState>, std::path::PathBuf) {
		let dir = std::env::temp_dir().join(format!("corral-api-{}-{}", std::process::id(), name));
		let _ = std::fs::remove_dir_all(&dir);
		let programs_dir = dir.join("programs");
		std::fs::create_dir_all(&programs_dir).unwrap();
		std::fs::write(
			programs_dir.join("app.toml"),
			"[program.web]\ncommand = \"sleep 30\"\nautostart = false\n",
		)
		.unwrap();

		let (sup, monitor) = Supervisor::new(SupervisorConfig {
			defaults: Defaults {
				log_dir: dir.join("logs"),
				start_grace: Duration::from_millis(50),
				..Defaults::default()
			},
			..SupervisorConfig::default()
		});
		tokio::spawn(monitor.run());
		sup.load_configuration(&programs_dir).await.unwrap();

		let state = Arc::new(DaemonState::new(sup, programs_dir, Some(0)));
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let app = router(Arc::clone(&state));
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		(addr, state, dir)
	}

	async fn http(addr: std::net::SocketAddr, method: &str, path: &str) -> (u16, String) {
		let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
		let request = format!(
			"{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
			method, path
		);
		stream.write_all(request.as_bytes()).await.unwrap();
		let mut raw = String::new();
		stream.read_to_string(&mut raw).await.unwrap();

		let status = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
		let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
		(status, body)
	}

	#[tokio::test]
	async fn list_and_detail() {
		let (addr, state, dir) = serve("list").await;

		let (status, body) = http(addr, "GET", "/api/processes").await;
		assert_eq!(status, 200);
		let list: Vec<ProcessStatus> = serde_json::from_str(&body).unwrap();
		assert_eq!(list.len(), 1);
		assert_eq!(list[0].name, "web");

		let (status, _) = http(addr, "GET", "/api/processes/web").await;
		assert_eq!(status, 200);
		let (status, body) = http(addr, "GET", "/api/processes/ghost").await;
		assert_eq!(status, 404);
		assert!(body.contains("no such program"), "{}", body);

		state.supervisor.shutdown_all(None).await;
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn start_and_stop_over_http() {
		let (addr, state, dir) = serve("actions").await;

		let (status, body) = http(addr, "POST", "/api/processes/web/start").await;
		assert_eq!(status, 200, "{}", body);
		assert!(state.supervisor.process_status("web").await.unwrap().is_running());

		let (status, body) = http(addr, "POST", "/api/processes/web/stop").await;
		assert_eq!(status, 200, "{}", body);
		assert!(body.contains("web: stopped"), "{}", body);

		let (status, _) = http(addr, "POST", "/api/processes/ghost/restart").await;
		assert_eq!(status, 404);

		let (status, body) = http(addr, "POST", "/api/reload").await;
		assert_eq!(status, 200, "{}", body);
		let summary: ReloadSummary = serde_json::from_str(&body).unwrap();
		assert!(summary.is_noop());

		state.supervisor.shutdown_all(None).await;
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn error_status_mapping() {
		assert_eq!(api_error(SupervisorError::NotFound("x".into())).0, StatusCode::NOT_FOUND);
		assert_eq!(api_error(SupervisorError::ShuttingDown).0, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(
			api_error(SupervisorError::Launch {
				name: "x".into(),
				message: "boom".into(),
			})
			.0,
			StatusCode::INTERNAL_SERVER_ERROR
		);
	}
}
