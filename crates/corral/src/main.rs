mod config;
mod daemon;
mod protocol;

use drover::{Phase, ProcessStatus, Stream};
use gatepost::{ClientError, DaemonClient, DaemonPaths};
use owo_colors::OwoColorize;
use protocol::{Request, Response};
use std::path::PathBuf;

/// Global flags plus the command and its own arguments.
#[derive(Debug, Default, PartialEq)]
struct Cli {
	config: Option<PathBuf>,
	socket: Option<PathBuf>,
	command: Option<String>,
	args: Vec<String>,
}

fn parse_cli(args: Vec<String>) -> Result<Cli, String> {
	let mut cli = Cli::default();
	let mut iter = args.into_iter();
	while let Some(arg) = iter.next() {
		let (flag, inline) = match arg.split_once('=') {
			Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
			_ => (arg.clone(), None),
		};
		let slot = match flag.as_str() {
			"--config" | "-c" => &mut cli.config,
			"--socket" => &mut cli.socket,
			_ => {
				if cli.command.is_none() {
					cli.command = Some(arg);
				} else {
					cli.args.push(arg);
				}
				continue;
			}
		};
		let value = inline
			.or_else(|| iter.next())
			.ok_or_else(|| format!("{} needs a path", flag))?;
		*slot = Some(PathBuf::from(value));
	}
	Ok(cli)
}

fn main() {
	let cli = match parse_cli(std::env::args().skip(1).collect()) {
		Ok(cli) => cli,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(2);
		}
	};

	let Some(command) = cli.command.clone() else {
		print_usage();
		if gatepost::client::is_running(&control_paths(&cli)) {
			eprintln!();
			cmd_status(&cli, &[]);
		}
		return;
	};

	let args = cli.args.clone();
	match command.as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("corral {}", env!("CARGO_PKG_VERSION")),
		"status" | "st" => cmd_status(&cli, &args),
		"start" => cmd_action(&cli, "start", &args),
		"stop" => cmd_action(&cli, "stop", &args),
		"restart" => cmd_action(&cli, "restart", &args),
		"reload" => cmd_reload(&cli),
		"logs" => cmd_logs(&cli, &args),
		"shutdown" => cmd_shutdown(&cli),
		"check" => cmd_check(&cli),
		"daemon" => cmd_daemon(&cli, &args),
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'corral help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {} - container process supervisor", "corral".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} [--config <file>] [--socket <path>] <command> [args]", "corral".bold());
	eprintln!();

	eprintln!("{}", "programs".cyan().bold());
	eprintln!("  {} [name...] [--json]        Show program status", "status".bold());
	eprintln!("  {} <name...|--all>            Start program(s)", "start".bold());
	eprintln!("  {} <name...|--all> [--timeout SECS]  Stop program(s)", "stop".bold());
	eprintln!("  {} <name...|--all>          Stop then start program(s)", "restart".bold());
	eprintln!("  {}                           Re-read the programs directory", "reload".bold());
	eprintln!("  {} <name> [--stderr] [-n N]    Recent output of a program", "logs".bold());
	eprintln!();

	eprintln!("{}", "supervisor".cyan().bold());
	eprintln!("  {} [--http]                  Run the supervisor in the foreground", "daemon".bold());
	eprintln!("  {}                         Stop all programs and exit the daemon", "shutdown".bold());
	eprintln!("  {}                            Validate settings and program files", "check".bold());
}

// --- Talking to the daemon ---

fn control_paths(cli: &Cli) -> DaemonPaths {
	match config::load_global_config(cli.config.as_deref()) {
		Ok((settings, _)) => settings.daemon_paths(cli.socket.as_deref()),
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(daemon::EXIT_SETTINGS);
		}
	}
}

fn send_request(cli: &Cli, request: &Request) -> Response {
	let paths = control_paths(cli);
	let result = DaemonClient::<Request, Response>::connect(&paths).and_then(|mut client| client.send(request));
	match result {
		Ok(response) => response,
		Err(ClientError::NotRunning) => {
			eprintln!("corral daemon not running (no socket at {})", paths.socket_path().display());
			std::process::exit(1);
		}
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

fn fail(message: &str) -> ! {
	eprintln!("{}", message.red());
	std::process::exit(1);
}

// --- Commands ---

fn cmd_status(cli: &Cli, args: &[String]) {
	let json = args.iter().any(|a| a == "--json");
	let names: Vec<String> = args.iter().filter(|a| !a.starts_with("--")).cloned().collect();

	let (processes, http_port) = match send_request(cli, &Request::Status { names }) {
		Response::Status { processes, http_port } => (processes, http_port),
		Response::Error { message } => fail(&message),
		other => fail(&format!("unexpected response: {:?}", other)),
	};

	if json {
		match serde_json::to_string_pretty(&processes) {
			Ok(s) => println!("{}", s),
			Err(e) => fail(&e.to_string()),
		}
		return;
	}

	if processes.is_empty() {
		eprintln!("no programs configured");
	}
	let width = processes.iter().map(|p| p.name.len()).max().unwrap_or(0);
	for p in &processes {
		print_process_line(p, width);
	}
	if let Some(port) = http_port {
		eprintln!();
		eprintln!("{}", format!("http api on 127.0.0.1:{}", port).dimmed());
	}
}

fn print_process_line(p: &ProcessStatus, name_width: usize) {
	let pid = p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
	let (circle, detail, label) = match p.phase {
		Phase::Running => (
			"●".green().to_string(),
			p.uptime_secs.map(format_uptime).unwrap_or_else(|| "-".to_string()),
			"running".green().to_string(),
		),
		Phase::Starting => ("●".yellow().to_string(), "-".to_string(), "starting".yellow().to_string()),
		Phase::Stopping => ("●".yellow().to_string(), "-".to_string(), "stopping".yellow().to_string()),
		Phase::Backoff => (
			"●".yellow().to_string(),
			format!("restart {}", p.restart_count),
			"backoff".yellow().to_string(),
		),
		Phase::Exited => ("○".dimmed().to_string(), exit_detail(p), "exited".dimmed().to_string()),
		Phase::Failed if p.retries_exhausted => (
			"●".red().to_string(),
			exit_detail(p),
			"failed, gave up".red().to_string(),
		),
		Phase::Failed => ("●".red().to_string(), exit_detail(p), "failed".red().to_string()),
		Phase::Stopped if !p.autostart => ("○".dimmed().to_string(), "-".to_string(), "stopped".dimmed().to_string()),
		Phase::Stopped => ("●".red().to_string(), "-".to_string(), "stopped".red().to_string()),
	};
	println!("{} {:<width$} {:<8} {:<8} {}", circle, p.name, detail, pid, label, width = name_width);

	if let Some(err) = &p.last_error {
		println!("  {}", err.dimmed());
	}
	if p.log_fallback {
		println!("  {}", "log file unavailable, output kept in memory".yellow());
	}
}

fn exit_detail(p: &ProcessStatus) -> String {
	match (p.exit_code, p.signal) {
		(Some(code), _) => format!("exit {}", code),
		(None, Some(sig)) => format!("signal {}", sig),
		(None, None) => "-".to_string(),
	}
}

fn cmd_action(cli: &Cli, action: &str, args: &[String]) {
	let mut names = Vec::new();
	let mut all = false;
	let mut timeout_secs = None;
	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"--all" | "-a" => all = true,
			"--timeout" | "-t" if action == "stop" => {
				let value = iter.next().and_then(|v| v.parse::<f64>().ok());
				match value {
					Some(secs) => timeout_secs = Some(secs),
					None => fail("--timeout needs a number of seconds"),
				}
			}
			_ => names.push(arg.clone()),
		}
	}
	if names.is_empty() && !all {
		fail(&format!("usage: corral {} <name...|--all>", action));
	}

	let request = match action {
		"start" => Request::Start { names, all },
		"stop" => Request::Stop { names, all, timeout_secs },
		_ => Request::Restart { names, all },
	};

	match send_request(cli, &request) {
		Response::Ok { message } => {
			for line in message.unwrap_or_default().lines() {
				println!("{}", line);
			}
		}
		Response::Error { message } => fail(&message),
		other => fail(&format!("unexpected response: {:?}", other)),
	}
}

fn cmd_reload(cli: &Cli) {
	match send_request(cli, &Request::Reload) {
		Response::Reloaded { summary } => {
			if summary.is_noop() {
				println!("no changes");
			}
			for name in &summary.added {
				println!("{} {}", "+".green(), name);
			}
			for name in &summary.changed {
				println!("{} {}", "~".yellow(), name);
			}
			for name in &summary.removed {
				println!("{} {}", "-".red(), name);
			}
		}
		Response::Error { message } => fail(&message),
		other => fail(&format!("unexpected response: {:?}", other)),
	}
}

fn cmd_logs(cli: &Cli, args: &[String]) {
	let mut name = None;
	let mut stream = Stream::Stdout;
	let mut lines = protocol::default_lines();
	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"--stderr" | "-e" => stream = Stream::Stderr,
			"-n" | "--lines" => match iter.next().and_then(|v| v.parse().ok()) {
				Some(n) => lines = n,
				None => fail("-n needs a number of lines"),
			},
			_ => name = Some(arg.clone()),
		}
	}
	let Some(name) = name else {
		fail("usage: corral logs <name> [--stderr] [-n N]");
	};

	match send_request(cli, &Request::Logs { name, stream, lines }) {
		Response::Log { text, fallback, .. } => {
			print!("{}", text);
			if fallback {
				eprintln!("{}", "(log file unavailable, showing in-memory buffer)".yellow());
			}
		}
		Response::Error { message } => fail(&message),
		other => fail(&format!("unexpected response: {:?}", other)),
	}
}

fn cmd_shutdown(cli: &Cli) {
	let paths = control_paths(cli);
	let result = DaemonClient::<Request, Response>::connect(&paths).and_then(|mut client| client.send(&Request::Shutdown));
	match result {
		Ok(Response::Ok { message }) => eprintln!("daemon: {}", message.unwrap_or_default()),
		Ok(Response::Error { message }) => fail(&message),
		Ok(other) => fail(&format!("unexpected response: {:?}", other)),
		Err(ClientError::NotRunning) => match gatepost::Daemon::new(paths).stop() {
			Ok(pid) => eprintln!("sent SIGTERM to daemon (pid {})", pid),
			Err(e) => fail(&e),
		},
		Err(e) => fail(&e.to_string()),
	}
}

fn cmd_check(cli: &Cli) {
	let (settings, path) = match config::load_global_config(cli.config.as_deref()) {
		Ok(loaded) => loaded,
		Err(e) => {
			eprintln!("{}", e.red());
			std::process::exit(daemon::EXIT_SETTINGS);
		}
	};
	let sup_config = match settings.supervisor_config() {
		Ok(c) => c,
		Err(e) => {
			eprintln!("{}", e.to_string().red());
			std::process::exit(daemon::EXIT_SETTINGS);
		}
	};
	match path {
		Some(path) => eprintln!("settings: {}", path.display()),
		None => eprintln!("settings: built-in defaults"),
	}

	let programs_dir = &settings.supervisor.programs_dir;
	let specs = match drover::config::load_dir(programs_dir, &sup_config.defaults) {
		Ok(specs) => specs,
		Err(e) => fail(&e.to_string()),
	};
	let levels = match drover::config::dependency_levels(&specs) {
		Ok(levels) => levels,
		Err(e) => fail(&e.to_string()),
	};

	eprintln!("programs: {} ({} defined)", programs_dir.display(), specs.len());
	for (n, level) in levels.iter().enumerate() {
		for name in level {
			if let Some(spec) = specs.iter().find(|s| &s.name == name) {
				let start = if spec.autostart { "autostart" } else { "manual" };
				println!(
					"{} {} {} {}",
					format!("[{}]", n).dimmed(),
					spec.name.bold(),
					format!("({}, {})", start, spec.autorestart).dimmed(),
					spec.command
				);
			}
		}
	}
	println!("{}", "ok".green());
}

fn cmd_daemon(cli: &Cli, args: &[String]) {
	let opts = daemon::DaemonOptions {
		config: cli.config.clone(),
		socket: cli.socket.clone(),
		http: args.iter().any(|a| a == "--http"),
	};

	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("error: failed to start runtime: {}", e);
			std::process::exit(1);
		}
	};
	let code = runtime.block_on(daemon::run(opts));
	drop(runtime);
	std::process::exit(code);
}

fn format_uptime(secs: u64) -> String {
	if secs < 60 {
		format!("{}s", secs)
	} else if secs < 3600 {
		let m = secs / 60;
		let s = secs % 60;
		if s == 0 { format!("{}m", m) } else { format!("{}m{}s", m, s) }
	} else if secs < 86400 {
		let h = secs / 3600;
		let m = (secs % 3600) / 60;
		if m == 0 { format!("{}h", h) } else { format!("{}h{}m", h, m) }
	} else {
		let d = secs / 86400;
		let h = (secs % 86400) / 3600;
		if h == 0 { format!("{}d", d) } else { format!("{}d{}h", d, h) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(s: &str) -> Vec<String> {
		s.split_whitespace().map(String::from).collect()
	}

	#[test]
	fn global_flags_anywhere() {
		let cli = parse_cli(args("--config /etc/corral.toml stop web --timeout 3 --socket=/run/c.sock")).unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/etc/corral.toml")));
		assert_eq!(cli.socket, Some(PathBuf::from("/run/c.sock")));
		assert_eq!(cli.command.as_deref(), Some("stop"));
		assert_eq!(cli.args, args("web --timeout 3"));
	}

	#[test]
	fn no_command() {
		assert_eq!(parse_cli(vec![]).unwrap(), Cli::default());
	}

	#[test]
	fn flag_without_value() {
		assert!(parse_cli(args("status --config")).is_err());
	}

	#[test]
	fn uptime_formatting() {
		assert_eq!(format_uptime(5), "5s");
		assert_eq!(format_uptime(120), "2m");
		assert_eq!(format_uptime(3725), "1h2m");
		assert_eq!(format_uptime(90000), "1d1h");
	}
}
