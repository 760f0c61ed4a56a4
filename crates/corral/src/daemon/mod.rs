pub mod api;

use drover::{logs, ReloadSummary, Supervisor, SupervisorError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

use crate::config;
use crate::protocol::{Request, Response};

/// Exit code for an unusable settings file.
pub const EXIT_SETTINGS: i32 = 2;
/// Exit code for program definitions that fail to load.
pub const EXIT_PROGRAMS: i32 = 1;

#[derive(Debug, Default)]
pub struct DaemonOptions {
	pub config: Option<PathBuf>,
	pub socket: Option<PathBuf>,
	pub http: bool,
}

/// Everything the control socket and the HTTP API act on.
pub struct DaemonState {
	pub supervisor: Arc<Supervisor>,
	pub programs_dir: PathBuf,
	pub http_port: Option<u16>,
	shutdown: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Start,
	Stop,
	Restart,
}

impl DaemonState {
	pub fn new(supervisor: Arc<Supervisor>, programs_dir: PathBuf, http_port: Option<u16>) -> Self {
		Self {
			supervisor,
			programs_dir,
			http_port,
			shutdown: Notify::new(),
		}
	}

	pub async fn act(&self, action: Action, name: &str, timeout: Option<Duration>) -> Result<String, SupervisorError> {
		match action {
			Action::Start => {
				self.supervisor.start(name).await?;
				Ok(format!("{}: started", name))
			}
			Action::Stop => {
				let outcome = self.supervisor.stop(name, timeout).await?;
				Ok(match (outcome.was_running, outcome.forced) {
					(false, _) => format!("{}: not running", name),
					(true, true) => format!("{}: killed after stop timeout", name),
					(true, false) => format!("{}: stopped", name),
				})
			}
			Action::Restart => {
				self.supervisor.restart(name).await?;
				Ok(format!("{}: restarted", name))
			}
		}
	}

	pub async fn reload(&self) -> Result<ReloadSummary, SupervisorError> {
		let summary = self.supervisor.load_configuration(&self.programs_dir).await?;
		tracing::info!("reloaded {}: {}", self.programs_dir.display(), summary);
		Ok(summary)
	}

	/// Ask the daemon's main loop to shut everything down.
	pub fn request_shutdown(&self) {
		self.shutdown.notify_one();
	}

	async fn targets(&self, names: Vec<String>, all: bool) -> Result<Vec<String>, String> {
		if all {
			return Ok(self.supervisor.status().await.into_iter().map(|s| s.name).collect());
		}
		if names.is_empty() {
			return Err("no program named (use --all for every program)".to_string());
		}
		Ok(names)
	}

	async fn act_on(&self, action: Action, names: Vec<String>, all: bool, timeout: Option<Duration>) -> Response {
		let names = match self.targets(names, all).await {
			Ok(n) => n,
			Err(message) => return Response::Error { message },
		};

		let mut lines = Vec::with_capacity(names.len());
		let mut failed = false;
		for name in &names {
			match self.act(action, name, timeout).await {
				Ok(line) => lines.push(line),
				Err(e) => {
					failed = true;
					lines.push(e.to_string());
				}
			}
		}

		let message = lines.join("\n");
		if failed {
			Response::Error { message }
		} else {
			Response::Ok { message: Some(message) }
		}
	}
}

pub async fn run(opts: DaemonOptions) -> i32 {
	let (settings, settings_path) = match config::load_global_config(opts.config.as_deref()) {
		Ok(loaded) => loaded,
		Err(e) => {
			eprintln!("corral: {}", e);
			return EXIT_SETTINGS;
		}
	};
	let level = match settings.log_level() {
		Ok(level) => level,
		Err(e) => {
			eprintln!("corral: {}", e);
			return EXIT_SETTINGS;
		}
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();

	match &settings_path {
		Some(path) => tracing::info!("settings from {}", path.display()),
		None => tracing::info!("no settings file, using defaults"),
	}

	let sup_config = match settings.supervisor_config() {
		Ok(c) => c,
		Err(e) => {
			tracing::error!("{}", e);
			return EXIT_SETTINGS;
		}
	};

	let (supervisor, monitor) = Supervisor::new(sup_config);
	let monitor_handle = tokio::spawn(monitor.run());

	let programs_dir = settings.supervisor.programs_dir.clone();
	match supervisor.load_configuration(&programs_dir).await {
		Ok(summary) => tracing::info!("loaded {} program(s) from {}", summary.added.len(), programs_dir.display()),
		Err(e) => {
			tracing::error!("{}", e);
			supervisor.shutdown_all(None).await;
			let _ = monitor_handle.await;
			return EXIT_PROGRAMS;
		}
	}

	let http_port = (opts.http || settings.http.enabled).then_some(settings.http.port);
	let state = Arc::new(DaemonState::new(Arc::clone(&supervisor), programs_dir, http_port));

	let daemon = gatepost::Daemon::new(settings.daemon_paths(opts.socket.as_deref()));
	let (socket_handle, owns_socket) = match serve_control_socket(&daemon, &state) {
		Ok(handle) => (Some(handle), true),
		Err(e) => {
			tracing::error!("{}", e);
			(None, false)
		}
	};

	let http_handle = match http_port {
		Some(port) => serve_http(&state, port).await,
		None => None,
	};

	let failures = supervisor.start_all().await;
	if failures.is_empty() {
		tracing::info!("all programs started");
	} else {
		tracing::warn!("{} program(s) did not start", failures.len());
	}

	wait_for_shutdown(&state).await;

	let report = supervisor.shutdown_all(settings.shutdown_timeout()).await;
	if !report.forced.is_empty() {
		tracing::warn!("killed after timeout: {}", report.forced.join(", "));
	}

	if let Some(h) = socket_handle {
		h.abort();
	}
	if let Some(h) = http_handle {
		h.abort();
	}
	if owns_socket {
		daemon.cleanup();
	}
	let _ = monitor_handle.await;

	tracing::info!("daemon stopped");
	0
}

fn serve_control_socket(
	daemon: &gatepost::Daemon,
	state: &Arc<DaemonState>,
) -> Result<tokio::task::JoinHandle<()>, SupervisorError> {
	daemon
		.prepare()
		.map_err(|e| SupervisorError::ControlChannel(e.to_string()))?;
	let listener = gatepost::server::bind(&daemon.paths).map_err(|e| {
		daemon.cleanup();
		SupervisorError::ControlChannel(format!("failed to bind {}: {}", daemon.paths.socket_path().display(), e))
	})?;

	let state = Arc::clone(state);
	Ok(tokio::spawn(gatepost::server::run_socket_server(
		listener,
		move |req: Request| {
			let state = Arc::clone(&state);
			async move { handle_request(&state, req).await }
		},
		|message: String| Response::Error { message },
	)))
}

async fn serve_http(state: &Arc<DaemonState>, port: u16) -> Option<tokio::task::JoinHandle<()>> {
	let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!("failed to bind HTTP on {}: {}", addr, e);
			return None;
		}
	};
	tracing::info!("HTTP listening on {}", addr);

	let app = api::router(Arc::clone(state));
	Some(tokio::spawn(async move {
		if let Err(e) = axum::serve(listener, app).await {
			tracing::error!("HTTP server error: {}", e);
		}
	}))
}

/// SIGTERM, SIGINT or a `shutdown` request ends the wait; SIGHUP reloads
/// the program definitions and keeps waiting.
async fn wait_for_shutdown(state: &DaemonState) {
	let mut term = watch_signal(SignalKind::terminate());
	let mut hup = watch_signal(SignalKind::hangup());

	loop {
		tokio::select! {
			_ = recv(&mut term) => {
				tracing::info!("SIGTERM received, shutting down");
				return;
			}
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("SIGINT received, shutting down");
				return;
			}
			_ = state.shutdown.notified() => {
				tracing::info!("shutdown requested");
				return;
			}
			_ = recv(&mut hup) => {
				tracing::info!("SIGHUP received, reloading");
				if let Err(e) = state.reload().await {
					tracing::error!("reload failed: {}", e);
				}
			}
		}
	}
}

fn watch_signal(kind: SignalKind) -> Option<tokio::signal::unix::Signal> {
	match signal(kind) {
		Ok(s) => Some(s),
		Err(e) => {
			tracing::warn!("cannot watch signal {:?}: {}", kind, e);
			None
		}
	}
}

async fn recv(sig: &mut Option<tokio::signal::unix::Signal>) {
	match sig {
		Some(s) => {
			s.recv().await;
		}
		None => std::future::pending::<()>().await,
	}
}

pub async fn handle_request(state: &DaemonState, request: Request) -> Response {
	match request {
		Request::Ping => Response::Pong {
			pid: std::process::id(),
			version: env!("CARGO_PKG_VERSION").to_string(),
		},
		Request::Status { names } => {
			let mut processes = state.supervisor.status().await;
			if !names.is_empty() {
				if let Some(missing) = names.iter().find(|n| !processes.iter().any(|p| &p.name == *n)) {
					return Response::Error {
						message: SupervisorError::NotFound(missing.clone()).to_string(),
					};
				}
				processes.retain(|p| names.contains(&p.name));
			}
			Response::Status {
				processes,
				http_port: state.http_port,
			}
		}
		Request::Start { names, all } => state.act_on(Action::Start, names, all, None).await,
		Request::Stop { names, all, timeout_secs } => {
			let timeout = match timeout_secs.map(Duration::try_from_secs_f64).transpose() {
				Ok(t) => t,
				Err(_) => {
					return Response::Error {
						message: "timeout must be a non-negative number of seconds".to_string(),
					}
				}
			};
			state.act_on(Action::Stop, names, all, timeout).await
		}
		Request::Restart { names, all } => state.act_on(Action::Restart, names, all, None).await,
		Request::Reload => match state.reload().await {
			Ok(summary) => Response::Reloaded { summary },
			Err(e) => Response::Error { message: e.to_string() },
		},
		Request::Logs { name, stream, lines } => match state.supervisor.output(&name, stream).await {
			Ok(capture) => {
				let snapshot = capture.snapshot().await;
				Response::Log {
					name,
					stream,
					text: logs::tail_lines(&String::from_utf8_lossy(&snapshot), lines),
					fallback: capture.is_fallback(),
				}
			}
			Err(e) => Response::Error { message: e.to_string() },
		},
		Request::Shutdown => {
			state.request_shutdown();
			Response::Ok {
				message: Some("shutting down".to_string()),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use drover::{Defaults, Phase, Stream, SupervisorConfig};

	fn temp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("corral-daemon-{}-{}", std::process::id(), name));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		dir
	}

	async fn test_state(name: &str, programs: &str) -> (Arc<DaemonState>, PathBuf) {
		let dir = temp_dir(name);
		let programs_dir = dir.join("programs");
		std::fs::create_dir_all(&programs_dir).unwrap();
		std::fs::write(programs_dir.join("app.toml"), programs).unwrap();

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
		(Arc::new(DaemonState::new(sup, programs_dir, None)), dir)
	}

	#[tokio::test]
	async fn ping_and_status() {
		let (state, dir) = test_state("status", "[program.web]\ncommand = \"sleep 30\"\nautostart = false\n").await;

		assert!(matches!(handle_request(&state, Request::Ping).await, Response::Pong { .. }));

		match handle_request(&state, Request::Status { names: vec![] }).await {
			Response::Status { processes, http_port } => {
				assert_eq!(processes.len(), 1);
				assert_eq!(processes[0].phase, Phase::Stopped);
				assert_eq!(http_port, None);
			}
			other => panic!("unexpected {:?}", other),
		}

		let resp = handle_request(&state, Request::Status { names: vec!["ghost".into()] }).await;
		assert!(matches!(resp, Response::Error { .. }));
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn start_stop_and_logs() {
		let (state, dir) = test_state(
			"start-stop",
			"[program.web]\ncommand = \"echo ready; sleep 30\"\nautostart = false\n",
		)
		.await;

		let resp = handle_request(&state, Request::Start { names: vec!["web".into()], all: false }).await;
		assert!(matches!(resp, Response::Ok { .. }), "{:?}", resp);

		let mut text = String::new();
		for _ in 0..50 {
			if let Response::Log { text: t, .. } = handle_request(
				&state,
				Request::Logs {
					name: "web".into(),
					stream: Stream::Stdout,
					lines: 10,
				},
			)
			.await
			{
				text = t;
			}
			if !text.is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert_eq!(text, "ready\n");

		let resp = handle_request(
			&state,
			Request::Stop {
				names: vec![],
				all: true,
				timeout_secs: Some(2.0),
			},
		)
		.await;
		match resp {
			Response::Ok { message } => assert_eq!(message.as_deref(), Some("web: stopped")),
			other => panic!("unexpected {:?}", other),
		}

		state.supervisor.shutdown_all(None).await;
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn errors_become_error_responses() {
		let (state, dir) = test_state("errors", "[program.web]\ncommand = \"sleep 30\"\nautostart = false\n").await;

		let resp = handle_request(&state, Request::Start { names: vec!["ghost".into()], all: false }).await;
		match resp {
			Response::Error { message } => assert!(message.contains("no such program"), "{}", message),
			other => panic!("unexpected {:?}", other),
		}

		let resp = handle_request(&state, Request::Restart { names: vec![], all: false }).await;
		assert!(matches!(resp, Response::Error { .. }));

		let resp = handle_request(
			&state,
			Request::Stop {
				names: vec!["web".into()],
				all: false,
				timeout_secs: Some(-1.0),
			},
		)
		.await;
		assert!(matches!(resp, Response::Error { .. }));

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn reload_picks_up_new_files() {
		let (state, dir) = test_state("reload", "[program.web]\ncommand = \"sleep 30\"\nautostart = false\n").await;
		std::fs::write(
			state.programs_dir.join("worker.toml"),
			"[program.worker]\ncommand = \"sleep 30\"\nautostart = false\n",
		)
		.unwrap();

		match handle_request(&state, Request::Reload).await {
			Response::Reloaded { summary } => {
				assert_eq!(summary.added, vec!["worker"]);
				assert_eq!(summary.unchanged, vec!["web"]);
			}
			other => panic!("unexpected {:?}", other),
		}

		std::fs::write(state.programs_dir.join("broken.toml"), "[program.x]\n").unwrap();
		assert!(matches!(handle_request(&state, Request::Reload).await, Response::Error { .. }));
		assert_eq!(state.supervisor.status().await.len(), 2);

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn shutdown_request_wakes_the_main_loop() {
		let (state, dir) = test_state("shutdown", "").await;
		let resp = handle_request(&state, Request::Shutdown).await;
		assert!(matches!(resp, Response::Ok { .. }));
		tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&state))
			.await
			.unwrap();
		let _ = std::fs::remove_dir_all(&dir);
	}
}
