use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::backoff::RestartSettings;
use crate::config::{self, Defaults};
use crate::error::SupervisorError;
use crate::logs;
use crate::monitor::{Command, Message, Monitor, ProcessTable};
use crate::output::{LogRotation, OutputCapture, DEFAULT_RING_SIZE};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	/// Program defaults; `defaults.log_dir` is also the log root.
	pub defaults: Defaults,
	pub rotation: LogRotation,
	/// Bytes of recent output kept in memory per stream.
	pub ring_size: usize,
	pub restart: RestartSettings,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			defaults: Defaults::default(),
			rotation: LogRotation::default(),
			ring_size: DEFAULT_RING_SIZE,
			restart: RestartSettings::default(),
		}
	}
}

impl SupervisorConfig {
	pub fn log_dir(&self) -> &Path {
		&self.defaults.log_dir
	}
}

/// Handle to a running supervisor.
///
/// Reads (status, output) go straight to the process table; everything that
/// changes it is queued to the [`Monitor`].
pub struct Supervisor {
	table: Arc<RwLock<ProcessTable>>,
	tx: mpsc::UnboundedSender<Message>,
	transitions: broadcast::Sender<Transition>,
	events: OutputCapture,
	config: Arc<SupervisorConfig>,
}

impl Supervisor {
	/// Build a supervisor and its monitor loop. Spawn `Monitor::run` before
	/// calling anything that changes state.
	pub fn new(config: SupervisorConfig) -> (Arc<Self>, Monitor) {
		let config = Arc::new(config);
		let table = Arc::new(RwLock::new(ProcessTable::default()));
		let (tx, rx) = mpsc::unbounded_channel();
		let (transitions, _) = broadcast::channel(1024);
		let events = OutputCapture::new(
			&logs::event_log_path(config.log_dir()),
			config.rotation,
			config.ring_size,
		);

		let monitor = Monitor::new(
			Arc::clone(&table),
			rx,
			tx.downgrade(),
			transitions.clone(),
			events.clone(),
			Arc::clone(&config),
		);

		let supervisor = Arc::new(Self {
			table,
			tx,
			transitions,
			events,
			config,
		});
		(supervisor, monitor)
	}

	pub fn config(&self) -> &SupervisorConfig {
		&self.config
	}

	/// Read every definition file in `dir` and apply it. The first call fills
	/// the table; later calls reconcile against it.
	pub async fn load_configuration(&self, dir: &Path) -> Result<ReloadSummary, SupervisorError> {
		let specs = config::load_dir(dir, &self.config.defaults)?;
		self.apply_specs(specs).await
	}

	pub async fn apply_specs(&self, specs: Vec<ProcessSpec>) -> Result<ReloadSummary, SupervisorError> {
		config::validate(&specs)?;
		let (reply, rx) = oneshot::channel();
		self.send(Command::Load { specs, reply })?;
		rx.await.map_err(|_| SupervisorError::ShuttingDown)
	}

	/// Launch every autostart program, dependency level by level. Returns the
	/// programs that did not come up, with the reason.
	pub async fn start_all(&self) -> BTreeMap<String, SupervisorError> {
		let mut failures = BTreeMap::new();
		if self.send(Command::EnableAutostart).is_err() {
			return failures;
		}

		let specs: Vec<ProcessSpec> = {
			let table = self.table.read().await;
			table
				.order
				.iter()
				.filter_map(|name| table.entries.get(name))
				.map(|mp| mp.spec.clone())
				.collect()
		};
		let by_name: BTreeMap<&str, &ProcessSpec> = specs.iter().map(|s| (s.name.as_str(), s)).collect();

		let levels = match config::dependency_levels(&specs) {
			Ok(levels) => levels,
			Err(e) => {
				for spec in specs.iter().filter(|s| s.autostart) {
					failures.insert(spec.name.clone(), e.clone());
				}
				return failures;
			}
		};

		for level in levels {
			let mut pending = Vec::new();
			for name in level {
				let Some(spec) = by_name.get(name.as_str()) else { continue };
				if !spec.autostart {
					continue;
				}

				let mut blocked_by = None;
				for dep in &spec.depends_on {
					if self.phase(dep).await != Some(Phase::Running) {
						blocked_by = Some(dep.clone());
						break;
					}
				}
				if let Some(dep) = blocked_by {
					let message = format!("dependency `{}` is not running", dep);
					let (reply, rx) = oneshot::channel();
					if self.send(Command::Blocked {
						name: name.clone(),
						message: message.clone(),
						reply,
					})
					.is_ok()
					{
						let _ = rx.await;
					}
					failures.insert(name.clone(), SupervisorError::Launch { name, message });
					continue;
				}

				let (reply, rx) = oneshot::channel();
				if self.send(Command::Start { name: name.clone(), reply }).is_err() {
					failures.insert(name, SupervisorError::ShuttingDown);
					continue;
				}
				pending.push((name, rx));
			}

			for (name, rx) in pending {
				match rx.await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => {
						failures.insert(name, e);
					}
					Err(_) => {
						failures.insert(name, SupervisorError::ShuttingDown);
					}
				}
			}
		}

		for (name, err) in &failures {
			tracing::warn!("{} failed to start: {}", name, err);
		}
		failures
	}

	/// Start one program and wait until it is running.
	pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Start {
			name: name.to_string(),
			reply,
		})?;
		rx.await.map_err(|_| SupervisorError::ShuttingDown)?
	}

	/// Stop one program (if running) and start it again with a fresh retry budget.
	pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Restart {
			name: name.to_string(),
			reply,
		})?;
		rx.await.map_err(|_| SupervisorError::ShuttingDown)?
	}

	/// SIGTERM, then SIGKILL after `timeout` (the program's `stopwaitsecs` if
	/// `None`). Resolves once the process is `stopped`.
	pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<StopOutcome, SupervisorError> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Stop {
			name: name.to_string(),
			timeout,
			reply,
		})?;
		rx.await.map_err(|_| SupervisorError::ShuttingDown)?
	}

	/// Stop everything concurrently and halt the monitor loop. No restarts or
	/// launches are accepted once this begins.
	pub async fn shutdown_all(&self, timeout: Option<Duration>) -> ShutdownReport {
		let mut report = ShutdownReport::default();

		let (reply, rx) = oneshot::channel();
		if self.send(Command::BeginShutdown { reply }).is_err() {
			return report;
		}
		let names = rx.await.unwrap_or_default();

		let mut pending = Vec::with_capacity(names.len());
		for name in names {
			let (reply, rx) = oneshot::channel();
			if self
				.send(Command::Stop {
					name: name.clone(),
					timeout,
					reply,
				})
				.is_ok()
			{
				pending.push((name, rx));
			}
		}

		for (name, rx) in pending {
			if let Ok(Ok(outcome)) = rx.await {
				if outcome.was_running {
					report.stopped.push(name.clone());
				}
				if outcome.forced {
					report.forced.push(name);
				}
			}
		}

		let (reply, rx) = oneshot::channel();
		if self.tx.send(Message::Halt(reply)).is_ok() {
			let _ = rx.await;
		}

		tracing::info!(
			"shutdown complete: {} stopped, {} killed",
			report.stopped.len(),
			report.forced.len()
		);
		report
	}

	pub async fn status(&self) -> Vec<ProcessStatus> {
		let table = self.table.read().await;
		table
			.order
			.iter()
			.filter_map(|name| table.entries.get(name))
			.map(|mp| mp.status())
			.collect()
	}

	pub async fn process_status(&self, name: &str) -> Option<ProcessStatus> {
		let table = self.table.read().await;
		table.entries.get(name).map(|mp| mp.status())
	}

	pub async fn phase(&self, name: &str) -> Option<Phase> {
		let table = self.table.read().await;
		table.entries.get(name).map(|mp| mp.state.phase)
	}

	pub async fn spec(&self, name: &str) -> Option<ProcessSpec> {
		let table = self.table.read().await;
		table.entries.get(name).map(|mp| mp.spec.clone())
	}

	pub async fn output(&self, name: &str, stream: Stream) -> Result<OutputCapture, SupervisorError> {
		let table = self.table.read().await;
		let mp = table
			.entries
			.get(name)
			.ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
		Ok(match stream {
			Stream::Stdout => mp.stdout.clone(),
			Stream::Stderr => mp.stderr.clone(),
		})
	}

	/// The supervisor's own event log.
	pub fn event_log(&self) -> &OutputCapture {
		&self.events
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
		self.transitions.subscribe()
	}

	fn send(&self, command: Command) -> Result<(), SupervisorError> {
		self.tx
			.send(Message::Command(command))
			.map_err(|_| SupervisorError::ShuttingDown)
	}
}
