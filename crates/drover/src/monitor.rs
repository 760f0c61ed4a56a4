//! The monitor loop: the only writer of the process table.
//!
//! Control commands and child events arrive on one queue and are applied one at
//! a time. Nothing in here waits on a child; timers and exit watchers are
//! spawned tasks that post events back, tagged with the launch generation so
//! that events for an older child are dropped.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncReadExt;
use tokio::process::Command as ChildCommand;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use nix::sys::signal::Signal;

use crate::error::SupervisorError;
use crate::logs;
use crate::output::OutputCapture;
use crate::supervisor::SupervisorConfig;
use crate::types::*;

/// How often a stopping process group is checked once its leader is gone.
const GROUP_POLL: Duration = Duration::from_millis(50);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

pub(crate) enum Message {
	Command(Command),
	Child(ChildEvent),
	/// Kill anything left and end the loop.
	Halt(oneshot::Sender<()>),
}

pub(crate) enum Command {
	Load {
		specs: Vec<ProcessSpec>,
		reply: oneshot::Sender<ReloadSummary>,
	},
	Start {
		name: String,
		reply: Reply<()>,
	},
	Restart {
		name: String,
		reply: Reply<()>,
	},
	Stop {
		name: String,
		timeout: Option<Duration>,
		reply: Reply<StopOutcome>,
	},
	EnableAutostart,
	Blocked {
		name: String,
		message: String,
		reply: oneshot::Sender<()>,
	},
	BeginShutdown {
		reply: oneshot::Sender<Vec<String>>,
	},
}

pub(crate) enum ChildEvent {
	Exited {
		name: String,
		generation: u64,
		exit: Option<ExitInfo>,
	},
	GraceElapsed { name: String, generation: u64 },
	Stable { name: String, generation: u64 },
	BackoffElapsed { name: String, generation: u64 },
	StopDeadline { name: String, generation: u64 },
	GroupCheck { name: String, generation: u64 },
}

#[derive(Default)]
pub(crate) struct ProcessTable {
	pub order: Vec<String>,
	pub entries: HashMap<String, ManagedProcess>,
}

pub(crate) struct ManagedProcess {
	pub spec: ProcessSpec,
	pub state: ProcessState,
	pub stdout: OutputCapture,
	pub stderr: OutputCapture,
	pub running_since: Option<Instant>,
	/// Process group of the last child, until it is known to be empty.
	pgid: Option<u32>,
	generation: u64,
	forced: bool,
	after_stop: AfterStop,
	ready_waiters: Vec<Reply<()>>,
	stop_waiters: Vec<Reply<StopOutcome>>,
}

/// What to do once the current child has been stopped.
#[derive(Default)]
struct AfterStop {
	relaunch: bool,
	replace: Option<ProcessSpec>,
	remove: bool,
}

impl ManagedProcess {
	fn new(spec: ProcessSpec, config: &SupervisorConfig) -> Self {
		let stdout = OutputCapture::new(&spec.stdout_logfile, config.rotation, config.ring_size);
		let stderr = OutputCapture::new(&spec.stderr_logfile, config.rotation, config.ring_size);
		Self {
			spec,
			state: ProcessState::default(),
			stdout,
			stderr,
			running_since: None,
			pgid: None,
			generation: 0,
			forced: false,
			after_stop: AfterStop::default(),
			ready_waiters: Vec::new(),
			stop_waiters: Vec::new(),
		}
	}

	pub fn status(&self) -> ProcessStatus {
		let exit = self.state.last_exit;
		ProcessStatus {
			name: self.spec.name.clone(),
			phase: self.state.phase,
			pid: self.state.pid,
			exit_code: exit.and_then(|e| e.code),
			signal: exit.and_then(|e| e.signal),
			restart_count: self.state.restart_count,
			retries_exhausted: self.state.retries_exhausted,
			uptime_secs: self.running_since.map(|t| t.elapsed().as_secs()),
			since_unix: unix_secs(self.state.since),
			autostart: self.spec.autostart,
			autorestart: self.spec.autorestart,
			last_error: self.state.last_error.clone(),
			log_fallback: self.stdout.is_fallback() || self.stderr.is_fallback(),
		}
	}

	fn resolve_ready(&mut self, result: Result<(), SupervisorError>) {
		for waiter in self.ready_waiters.drain(..) {
			let _ = waiter.send(result.clone());
		}
	}
}

pub struct Monitor {
	table: Arc<RwLock<ProcessTable>>,
	rx: mpsc::UnboundedReceiver<Message>,
	tx: mpsc::WeakUnboundedSender<Message>,
	transitions: broadcast::Sender<Transition>,
	events: OutputCapture,
	config: Arc<SupervisorConfig>,
	autostart_enabled: bool,
	shutting_down: bool,
}

impl Monitor {
	pub(crate) fn new(
		table: Arc<RwLock<ProcessTable>>,
		rx: mpsc::UnboundedReceiver<Message>,
		tx: mpsc::WeakUnboundedSender<Message>,
		transitions: broadcast::Sender<Transition>,
		events: OutputCapture,
		config: Arc<SupervisorConfig>,
	) -> Self {
		Self {
			table,
			rx,
			tx,
			transitions,
			events,
			config,
			autostart_enabled: false,
			shutting_down: false,
		}
	}

	/// Run until the supervisor halts or every handle is gone.
	pub async fn run(mut self) {
		while let Some(message) = self.rx.recv().await {
			match message {
				Message::Halt(reply) => {
					self.halt().await;
					let _ = reply.send(());
					return;
				}
				Message::Command(command) => self.handle_command(command).await,
				Message::Child(event) => self.handle_child(event).await,
			}
		}
		self.halt().await;
	}

	async fn handle_command(&mut self, command: Command) {
		let table = Arc::clone(&self.table);
		let mut table = table.write().await;

		match command {
			Command::Load { specs, reply } => {
				let summary = self.reconcile(&mut table, specs).await;
				let _ = reply.send(summary);
			}
			Command::Start { name, reply } => {
				if self.shutting_down {
					let _ = reply.send(Err(SupervisorError::ShuttingDown));
					return;
				}
				let Some(entry) = table.entries.get_mut(&name) else {
					let _ = reply.send(Err(SupervisorError::NotFound(name)));
					return;
				};
				match entry.state.phase {
					Phase::Running => {
						let _ = reply.send(Ok(()));
					}
					Phase::Starting => entry.ready_waiters.push(reply),
					Phase::Stopping => {
						entry.after_stop.relaunch = true;
						entry.ready_waiters.push(reply);
					}
					Phase::Stopped | Phase::Exited | Phase::Failed | Phase::Backoff => {
						reset_retries(entry);
						entry.ready_waiters.push(reply);
						let _ = self.launch(entry).await;
					}
				}
			}
			Command::Restart { name, reply } => {
				if self.shutting_down {
					let _ = reply.send(Err(SupervisorError::ShuttingDown));
					return;
				}
				let Some(entry) = table.entries.get_mut(&name) else {
					let _ = reply.send(Err(SupervisorError::NotFound(name)));
					return;
				};
				reset_retries(entry);
				entry.ready_waiters.push(reply);
				match entry.state.phase {
					Phase::Starting | Phase::Running => {
						entry.after_stop.relaunch = true;
						self.begin_stop(entry, None).await;
					}
					Phase::Stopping => entry.after_stop.relaunch = true,
					Phase::Stopped | Phase::Exited | Phase::Failed | Phase::Backoff => {
						let _ = self.launch(entry).await;
					}
				}
			}
			Command::Stop { name, timeout, reply } => {
				let Some(entry) = table.entries.get_mut(&name) else {
					let _ = reply.send(Err(SupervisorError::NotFound(name)));
					return;
				};
				entry.after_stop.relaunch = false;
				match entry.state.phase {
					Phase::Starting | Phase::Running => {
						entry.stop_waiters.push(reply);
						self.begin_stop(entry, timeout).await;
					}
					Phase::Stopping => {
						entry.stop_waiters.push(reply);
						if let Some(timeout) = timeout {
							self.schedule(
								timeout,
								ChildEvent::StopDeadline {
									name: name.clone(),
									generation: entry.generation,
								},
							);
						}
					}
					Phase::Stopped | Phase::Exited | Phase::Failed | Phase::Backoff => {
						if entry.state.phase != Phase::Stopped {
							self.transition(entry, Phase::Stopped);
						}
						let _ = reply.send(Ok(StopOutcome {
							forced: false,
							was_running: false,
						}));
					}
				}
			}
			Command::EnableAutostart => self.autostart_enabled = true,
			Command::Blocked { name, message, reply } => {
				if let Some(entry) = table.entries.get_mut(&name) {
					if !entry.state.phase.is_live() {
						entry.state.last_error = Some(message.clone());
						if entry.state.phase != Phase::Failed {
							self.transition(entry, Phase::Failed);
						}
						tracing::error!("{}: not started: {}", name, message);
						self.report(entry, &format!("{}: not started: {}", name, message)).await;
					}
				}
				let _ = reply.send(());
			}
			Command::BeginShutdown { reply } => {
				self.shutting_down = true;
				self.log_event("shutting down, stopping all programs").await;
				let names = table.order.clone();
				for name in &names {
					if let Some(entry) = table.entries.get_mut(name) {
						entry.after_stop.relaunch = false;
						entry.after_stop.replace = None;
						if entry.state.phase == Phase::Backoff {
							self.transition(entry, Phase::Stopped);
						}
					}
				}
				let _ = reply.send(names);
			}
		}
	}

	async fn handle_child(&mut self, event: ChildEvent) {
		let table = Arc::clone(&self.table);
		let mut table = table.write().await;

		match event {
			ChildEvent::Exited { name, generation, exit } => {
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation != generation || !entry.state.phase.is_live() {
					return;
				}

				let exit = exit.unwrap_or(ExitInfo { code: None, signal: None });
				entry.state.pid = None;
				entry.state.last_exit = Some(exit);
				entry.running_since = None;

				if entry.state.phase == Phase::Stopping {
					if !entry.forced && entry.pgid.is_some_and(group_alive) {
						self.schedule(GROUP_POLL, ChildEvent::GroupCheck { name, generation });
						return;
					}
					kill_leftovers(entry);
					self.finish_stop(&mut table, &name).await;
					return;
				}
				kill_leftovers(entry);

				let was_starting = entry.state.phase == Phase::Starting;
				if exit.success() {
					self.transition(entry, Phase::Exited);
					self.report(entry, &format!("{} exited ({})", name, exit)).await;
				} else {
					self.transition(entry, Phase::Failed);
					tracing::warn!("{} crashed ({})", name, exit);
					self.report(entry, &format!("{} crashed ({})", name, exit)).await;
				}
				if was_starting {
					entry.resolve_ready(Err(SupervisorError::Crashed {
						name: name.clone(),
						exit,
					}));
				}

				if self.shutting_down || !entry.spec.autorestart.permits(&exit) {
					return;
				}

				if entry.state.restart_count >= entry.spec.start_retries {
					entry.state.retries_exhausted = true;
					if entry.state.phase != Phase::Failed {
						self.transition(entry, Phase::Failed);
					}
					let err = SupervisorError::RetryExhausted {
						name: name.clone(),
						restarts: entry.state.restart_count,
					};
					tracing::error!("{}", err);
					entry.state.last_error = Some(err.to_string());
					self.report(entry, &format!("ALERT {}, not restarting", err)).await;
					return;
				}

				entry.state.restart_count += 1;
				let delay = self.config.restart.delay_for(entry.state.restart_count);
				self.transition(entry, Phase::Backoff);
				self.report(
					entry,
					&format!(
						"{}: restart {}/{} in {}ms",
						name,
						entry.state.restart_count,
						entry.spec.start_retries,
						delay.as_millis()
					),
				)
				.await;
				self.schedule(delay, ChildEvent::BackoffElapsed { name, generation });
			}
			ChildEvent::GraceElapsed { name, generation } => {
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation == generation && entry.state.phase == Phase::Starting {
					self.mark_running(entry);
				}
			}
			ChildEvent::Stable { name, generation } => {
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation == generation
					&& entry.state.phase == Phase::Running
					&& entry.state.restart_count > 0
				{
					tracing::debug!("{} stable, resetting restart count", name);
					reset_retries(entry);
				}
			}
			ChildEvent::BackoffElapsed { name, generation } => {
				if self.shutting_down {
					return;
				}
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation == generation && entry.state.phase == Phase::Backoff {
					let _ = self.launch(entry).await;
				}
			}
			ChildEvent::StopDeadline { name, generation } => {
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation != generation || entry.state.phase != Phase::Stopping {
					return;
				}
				let Some(pgid) = entry.pgid else { return };
				entry.forced = true;
				tracing::warn!("{} ignored SIGTERM, sending SIGKILL", name);
				self.report(entry, &format!("{} did not stop in time, killing", name)).await;
				signal_group(pgid, Signal::SIGKILL);
				if entry.state.pid.is_none() {
					entry.pgid = None;
					self.finish_stop(&mut table, &name).await;
				}
			}
			ChildEvent::GroupCheck { name, generation } => {
				let Some(entry) = table.entries.get_mut(&name) else { return };
				if entry.generation != generation
					|| entry.state.phase != Phase::Stopping
					|| entry.state.pid.is_some()
				{
					return;
				}
				if entry.pgid.is_some_and(group_alive) {
					self.schedule(GROUP_POLL, ChildEvent::GroupCheck { name, generation });
					return;
				}
				entry.pgid = None;
				self.finish_stop(&mut table, &name).await;
			}
		}
	}

	async fn reconcile(&mut self, table: &mut ProcessTable, specs: Vec<ProcessSpec>) -> ReloadSummary {
		let mut summary = ReloadSummary::default();
		let wanted: HashSet<String> = specs.iter().map(|s| s.name.clone()).collect();
		let previous = table.order.clone();

		for name in &previous {
			if wanted.contains(name) {
				continue;
			}
			summary.removed.push(name.clone());
			let Some(entry) = table.entries.get_mut(name) else { continue };
			if entry.state.phase.is_live() {
				entry.after_stop = AfterStop {
					relaunch: false,
					replace: None,
					remove: true,
				};
				if entry.state.phase != Phase::Stopping {
					self.begin_stop(entry, None).await;
				}
			} else {
				table.entries.remove(name);
			}
		}

		let mut order = Vec::with_capacity(specs.len());
		for spec in specs {
			let name = spec.name.clone();
			order.push(name.clone());

			match table.entries.get_mut(&name) {
				None => {
					summary.added.push(name.clone());
					let launch = self.autostart_enabled && spec.autostart && !self.shutting_down;
					let entry = table
						.entries
						.entry(name.clone())
						.or_insert_with(|| ManagedProcess::new(spec, &self.config));
					if launch {
						let _ = self.launch(entry).await;
					}
				}
				Some(entry) if entry.spec == spec => {
					entry.after_stop.remove = false;
					summary.unchanged.push(name);
				}
				Some(entry) => {
					summary.changed.push(name.clone());
					entry.after_stop.remove = false;
					if entry.state.phase.is_live() {
						entry.after_stop.relaunch = false;
						entry.after_stop.replace = Some(spec);
						if entry.state.phase != Phase::Stopping {
							self.begin_stop(entry, None).await;
						}
					} else {
						self.replace_spec(entry, spec);
						if self.autostart_enabled && entry.spec.autostart && !self.shutting_down {
							let _ = self.launch(entry).await;
						}
					}
				}
			}
		}

		for name in previous {
			if table.entries.contains_key(&name) && !order.contains(&name) {
				order.push(name);
			}
		}
		table.order = order;

		if !summary.is_noop() {
			self.log_event(&format!("configuration applied ({})", summary)).await;
		}
		summary
	}

	async fn launch(&self, entry: &mut ManagedProcess) -> Result<(), SupervisorError> {
		let name = entry.spec.name.clone();
		kill_leftovers(entry);

		let mut cmd = ChildCommand::new("sh");
		cmd.args(["-c", &entry.spec.command])
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);
		if let Some(dir) = &entry.spec.directory {
			cmd.current_dir(dir);
		}
		cmd.envs(&entry.spec.environment);

		let mut child = match cmd.spawn() {
			Ok(child) => child,
			Err(e) => {
				let err = SupervisorError::Launch {
					name: name.clone(),
					message: e.to_string(),
				};
				tracing::error!("{}", err);
				entry.state.pid = None;
				entry.state.last_error = Some(err.to_string());
				self.transition(entry, Phase::Failed);
				self.report(entry, &err.to_string()).await;
				entry.resolve_ready(Err(err.clone()));
				return Err(err);
			}
		};

		entry.generation += 1;
		let generation = entry.generation;
		entry.state.pid = child.id();
		entry.pgid = entry.state.pid;
		entry.state.last_error = None;
		entry.forced = false;
		entry.running_since = None;
		self.transition(entry, Phase::Starting);

		if let Some(stdout) = child.stdout.take() {
			let out = entry.stdout.clone();
			tokio::spawn(async move {
				pipe_output(stdout, out).await;
			});
		}
		if let Some(stderr) = child.stderr.take() {
			let out = entry.stderr.clone();
			tokio::spawn(async move {
				pipe_output(stderr, out).await;
			});
		}

		if let Some(tx) = self.tx.upgrade() {
			let name = name.clone();
			tokio::spawn(async move {
				let exit = child.wait().await.ok().map(ExitInfo::from_status);
				let _ = tx.send(Message::Child(ChildEvent::Exited { name, generation, exit }));
			});
		}

		if entry.spec.start_grace.is_zero() {
			self.mark_running(entry);
		} else {
			self.schedule(entry.spec.start_grace, ChildEvent::GraceElapsed { name, generation });
		}
		Ok(())
	}

	fn mark_running(&self, entry: &mut ManagedProcess) {
		entry.running_since = Some(Instant::now());
		self.transition(entry, Phase::Running);
		entry.resolve_ready(Ok(()));
		self.schedule(
			self.config.restart.stability_threshold,
			ChildEvent::Stable {
				name: entry.spec.name.clone(),
				generation: entry.generation,
			},
		);
	}

	async fn begin_stop(&self, entry: &mut ManagedProcess, timeout: Option<Duration>) {
		let timeout = timeout.unwrap_or(entry.spec.stop_timeout);
		self.transition(entry, Phase::Stopping);
		match entry.pgid {
			Some(pgid) => {
				signal_group(pgid, Signal::SIGTERM);
			}
			None => tracing::warn!("{} has no process group, waiting for its exit", entry.spec.name),
		}
		self.schedule(
			timeout,
			ChildEvent::StopDeadline {
				name: entry.spec.name.clone(),
				generation: entry.generation,
			},
		);
	}

	async fn finish_stop(&self, table: &mut ProcessTable, name: &str) {
		let Some(entry) = table.entries.get_mut(name) else { return };

		let outcome = StopOutcome {
			forced: entry.forced,
			was_running: true,
		};
		self.transition(entry, Phase::Stopped);
		let how = if outcome.forced { "killed" } else { "stopped" };
		self.report(entry, &format!("{} {}", name, how)).await;
		for waiter in entry.stop_waiters.drain(..) {
			let _ = waiter.send(Ok(outcome));
		}

		let after = std::mem::take(&mut entry.after_stop);
		if after.remove {
			entry.resolve_ready(Err(SupervisorError::Interrupted(name.to_string())));
			table.entries.remove(name);
			table.order.retain(|n| n != name);
			return;
		}

		let mut relaunch = after.relaunch;
		if let Some(spec) = after.replace {
			self.replace_spec(entry, spec);
			relaunch = relaunch || (self.autostart_enabled && entry.spec.autostart);
		}

		if relaunch && !self.shutting_down {
			reset_retries(entry);
			let _ = self.launch(entry).await;
		} else {
			entry.resolve_ready(Err(SupervisorError::Interrupted(name.to_string())));
		}
	}

	fn replace_spec(&self, entry: &mut ManagedProcess, spec: ProcessSpec) {
		if spec.stdout_logfile != entry.spec.stdout_logfile {
			entry.stdout = OutputCapture::new(&spec.stdout_logfile, self.config.rotation, self.config.ring_size);
		}
		if spec.stderr_logfile != entry.spec.stderr_logfile {
			entry.stderr = OutputCapture::new(&spec.stderr_logfile, self.config.rotation, self.config.ring_size);
		}
		entry.spec = spec;
		reset_retries(entry);
	}

	/// Last resort on the way out: nothing we launched may outlive us.
	async fn halt(&mut self) {
		let table = Arc::clone(&self.table);
		let mut table = table.write().await;
		for entry in table.entries.values_mut() {
			kill_leftovers(entry);
		}
		self.log_event("supervisor halted").await;
	}

	fn transition(&self, entry: &mut ManagedProcess, to: Phase) {
		let from = entry.state.phase;
		let now = SystemTime::now();
		entry.state.phase = to;
		entry.state.since = now;
		tracing::info!("{}: {} -> {}", entry.spec.name, from, to);
		let _ = self.transitions.send(Transition {
			name: entry.spec.name.clone(),
			from,
			to,
			restart_count: entry.state.restart_count,
			at_unix_ms: unix_millis(now),
		});
	}

	fn schedule(&self, delay: Duration, event: ChildEvent) {
		let Some(tx) = self.tx.upgrade() else { return };
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = tx.send(Message::Child(event));
		});
	}

	/// Write to the process' stderr log and the supervisor event log.
	async fn report(&self, entry: &ManagedProcess, message: &str) {
		entry.stderr.note(message).await;
		self.log_event(message).await;
	}

	async fn log_event(&self, message: &str) {
		let line = format!("{} {}\n", logs::timestamp(), message);
		self.events.write(line.as_bytes()).await;
	}
}

/// SIGKILL whatever is left of the entry's last process group.
fn kill_leftovers(entry: &mut ManagedProcess) {
	if let Some(pgid) = entry.pgid.take() {
		if signal_group(pgid, Signal::SIGKILL) {
			tracing::warn!("{}: killed processes left in group {}", entry.spec.name, pgid);
		}
	}
}

fn reset_retries(entry: &mut ManagedProcess) {
	entry.state.restart_count = 0;
	entry.state.retries_exhausted = false;
}

async fn pipe_output<R: tokio::io::AsyncRead + Unpin>(mut reader: R, output: OutputCapture) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => output.write(&buf[..n]).await,
			Err(_) => break,
		}
	}
}

/// Signal the whole process group `pgid`. Returns false if it is already gone.
pub(crate) fn signal_group(pgid: u32, signal: Signal) -> bool {
	use nix::errno::Errno;
	use nix::sys::signal::killpg;
	use nix::unistd::Pid;

	if pgid == 0 {
		return false;
	}
	match killpg(Pid::from_raw(pgid as i32), signal) {
		Ok(()) => true,
		Err(Errno::ESRCH) => false,
		Err(e) => {
			tracing::warn!("failed to send {} to group {}: {}", signal, pgid, e);
			false
		}
	}
}

/// True while any process is left in the group. Only called after the leader
/// has been reaped. Members reparented to us (when we run as PID 1) are reaped
/// here so their zombies do not keep the group alive.
fn group_alive(pgid: u32) -> bool {
	use nix::sys::signal::killpg;
	use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
	use nix::unistd::Pid;

	if pgid == 0 {
		return false;
	}
	let group = Pid::from_raw(-(pgid as i32));
	while let Ok(status) = waitpid(group, Some(WaitPidFlag::WNOHANG)) {
		if matches!(status, WaitStatus::StillAlive) {
			break;
		}
	}
	killpg(Pid::from_raw(pgid as i32), None::<Signal>).is_ok()
}
