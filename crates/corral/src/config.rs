use drover::{Defaults, LogRotation, RestartPolicy, RestartSettings, SupervisorConfig, SupervisorError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::daemon_paths;

// ── Settings file (corral.toml) ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
	#[serde(default)]
	pub supervisor: SupervisorSection,
	#[serde(default)]
	pub logs: LogsConfig,
	#[serde(default)]
	pub restart: RestartConfig,
	#[serde(default)]
	pub defaults: DefaultsConfig,
	#[serde(default)]
	pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
	#[serde(default = "default_programs_dir")]
	pub programs_dir: PathBuf,
	#[serde(default = "default_log_dir")]
	pub log_dir: PathBuf,
	pub socket: Option<PathBuf>,
	pub env_file: Option<PathBuf>,
	/// Overrides every program's `stopwaitsecs` during shutdown.
	pub shutdown_timeout_secs: Option<f64>,
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

impl Default for SupervisorSection {
	fn default() -> Self {
		Self {
			programs_dir: default_programs_dir(),
			log_dir: default_log_dir(),
			socket: None,
			env_file: None,
			shutdown_timeout_secs: None,
			log_level: default_log_level(),
		}
	}
}

fn default_programs_dir() -> PathBuf { PathBuf::from("/etc/corral/programs") }
fn default_log_dir() -> PathBuf { PathBuf::from("/var/log/corral") }
fn default_log_level() -> String { "info".to_string() }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogsConfig {
	#[serde(default = "default_max_size")]
	pub max_size_bytes: u64,
	#[serde(default = "default_max_backups")]
	pub max_backups: u32,
	#[serde(default = "default_memory_buffer")]
	pub memory_buffer_bytes: usize,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			max_size_bytes: default_max_size(),
			max_backups: default_max_backups(),
			memory_buffer_bytes: default_memory_buffer(),
		}
	}
}

fn default_max_size() -> u64 { 10 * 1024 * 1024 }
fn default_max_backups() -> u32 { 5 }
fn default_memory_buffer() -> usize { 64 * 1024 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartConfig {
	#[serde(default = "default_base_delay")]
	pub base_delay_ms: u64,
	#[serde(default = "default_max_delay")]
	pub max_delay_ms: u64,
	#[serde(default = "default_stability")]
	pub stability_secs: u64,
}

impl Default for RestartConfig {
	fn default() -> Self {
		Self {
			base_delay_ms: default_base_delay(),
			max_delay_ms: default_max_delay(),
			stability_secs: default_stability(),
		}
	}
}

fn default_base_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 30_000 }
fn default_stability() -> u64 { 10 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
	#[serde(default = "default_true")]
	pub autostart: bool,
	#[serde(default)]
	pub autorestart: RestartPolicy,
	#[serde(default = "default_start_retries")]
	pub startretries: u32,
	#[serde(default = "default_startsecs")]
	pub startsecs: f64,
	#[serde(default = "default_stopwaitsecs")]
	pub stopwaitsecs: f64,
	#[serde(default)]
	pub environment: BTreeMap<String, String>,
}

impl Default for DefaultsConfig {
	fn default() -> Self {
		Self {
			autostart: true,
			autorestart: RestartPolicy::default(),
			startretries: default_start_retries(),
			startsecs: default_startsecs(),
			stopwaitsecs: default_stopwaitsecs(),
			environment: BTreeMap::new(),
		}
	}
}

fn default_true() -> bool { true }
fn default_start_retries() -> u32 { 3 }
fn default_startsecs() -> f64 { 1.0 }
fn default_stopwaitsecs() -> f64 { 10.0 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_port")]
	pub port: u16,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self { enabled: false, port: default_port() }
	}
}

fn default_port() -> u16 { 9001 }

// ── Locating and loading ────────────────────────────────────────────────────

/// `--config`, then `$CORRAL_CONFIG`, then `<config_dir>/config.toml` if it exists.
/// An explicitly named file must exist; the default location is optional.
pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>, String> {
	let named = explicit
		.map(Path::to_path_buf)
		.or_else(|| std::env::var_os("CORRAL_CONFIG").map(PathBuf::from));
	if let Some(path) = named {
		if !path.is_file() {
			return Err(format!("settings file {} not found", path.display()));
		}
		return Ok(Some(path));
	}

	let path = daemon_paths().config_dir().join("config.toml");
	Ok(path.is_file().then_some(path))
}

pub fn load_global_config(explicit: Option<&Path>) -> Result<(GlobalConfig, Option<PathBuf>), String> {
	let Some(path) = locate(explicit)? else {
		return Ok((GlobalConfig::default(), None));
	};
	let content = std::fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	let config = parse(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
	Ok((config, Some(path)))
}

pub fn parse(content: &str) -> Result<GlobalConfig, String> {
	let config: GlobalConfig = toml::from_str(content).map_err(|e| e.to_string().trim().to_string())?;
	config.log_level()?;
	Ok(config)
}

impl GlobalConfig {
	pub fn log_level(&self) -> Result<tracing::Level, String> {
		self.supervisor
			.log_level
			.parse()
			.map_err(|_| format!("invalid log_level `{}`", self.supervisor.log_level))
	}

	pub fn shutdown_timeout(&self) -> Option<Duration> {
		self.supervisor
			.shutdown_timeout_secs
			.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
	}

	/// Settings for the supervisor library. Reads the env file, whose
	/// variables sit underneath `[defaults.environment]`.
	pub fn supervisor_config(&self) -> Result<SupervisorConfig, SupervisorError> {
		let mut environment = match &self.supervisor.env_file {
			Some(path) => drover::config::load_env_file(path)?,
			None => BTreeMap::new(),
		};
		environment.extend(self.defaults.environment.clone());

		let seconds = |value: f64, field: &str| {
			Duration::try_from_secs_f64(value).map_err(|_| SupervisorError::Config {
				path: None,
				message: format!("[defaults] {} must be a non-negative number of seconds", field),
			})
		};

		Ok(SupervisorConfig {
			defaults: Defaults {
				log_dir: self.supervisor.log_dir.clone(),
				autostart: self.defaults.autostart,
				autorestart: self.defaults.autorestart,
				start_retries: self.defaults.startretries,
				start_grace: seconds(self.defaults.startsecs, "startsecs")?,
				stop_timeout: seconds(self.defaults.stopwaitsecs, "stopwaitsecs")?,
				environment,
			},
			rotation: LogRotation {
				max_size: self.logs.max_size_bytes,
				max_backups: self.logs.max_backups,
			},
			ring_size: self.logs.memory_buffer_bytes,
			restart: RestartSettings {
				base_delay: Duration::from_millis(self.restart.base_delay_ms),
				max_delay: Duration::from_millis(self.restart.max_delay_ms),
				stability_threshold: Duration::from_secs(self.restart.stability_secs),
			},
		})
	}

	/// Control socket location: `--socket`, then `[supervisor] socket`, then the state dir.
	pub fn daemon_paths(&self, socket: Option<&Path>) -> gatepost::DaemonPaths {
		let paths = daemon_paths();
		match socket.map(Path::to_path_buf).or_else(|| self.supervisor.socket.clone()) {
			Some(socket) => paths.with_socket(socket),
			None => paths,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_gives_defaults() {
		let config = parse("").unwrap();
		assert_eq!(config.supervisor.programs_dir, PathBuf::from("/etc/corral/programs"));
		assert_eq!(config.supervisor.log_dir, PathBuf::from("/var/log/corral"));
		assert_eq!(config.logs.max_backups, 5);
		assert_eq!(config.restart.base_delay_ms, 500);
		assert_eq!(config.defaults.startretries, 3);
		assert_eq!(config.defaults.autorestart, RestartPolicy::OnFailure);
		assert!(!config.http.enabled);
		assert_eq!(config.log_level().unwrap(), tracing::Level::INFO);
		assert_eq!(config.shutdown_timeout(), None);
	}

	#[test]
	fn full_file() {
		let config = parse(
			r#"
[supervisor]
programs_dir = "/app/programs"
log_dir = "/app/logs"
socket = "/run/corral.sock"
shutdown_timeout_secs = 5
log_level = "debug"

[logs]
max_size_bytes = 1024
max_backups = 0
memory_buffer_bytes = 512

[restart]
base_delay_ms = 100
max_delay_ms = 1000
stability_secs = 2

[defaults]
autorestart = "always"
startretries = 7
startsecs = 0.5

[defaults.environment]
PYTHONUNBUFFERED = "1"

[http]
enabled = true
port = 8080
"#,
		)
		.unwrap();

		assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
		assert_eq!(config.shutdown_timeout(), Some(Duration::from_secs(5)));
		assert_eq!(config.http.port, 8080);

		let sup = config.supervisor_config().unwrap();
		assert_eq!(sup.log_dir(), Path::new("/app/logs"));
		assert_eq!(sup.rotation, LogRotation { max_size: 1024, max_backups: 0 });
		assert_eq!(sup.ring_size, 512);
		assert_eq!(sup.restart.base_delay, Duration::from_millis(100));
		assert_eq!(sup.restart.stability_threshold, Duration::from_secs(2));
		assert_eq!(sup.defaults.autorestart, RestartPolicy::Always);
		assert_eq!(sup.defaults.start_retries, 7);
		assert_eq!(sup.defaults.start_grace, Duration::from_millis(500));
		assert_eq!(sup.defaults.environment["PYTHONUNBUFFERED"], "1");

		let paths = config.daemon_paths(None);
		assert_eq!(paths.socket_path(), PathBuf::from("/run/corral.sock"));
		let paths = config.daemon_paths(Some(Path::new("/tmp/other.sock")));
		assert_eq!(paths.pid_path(), PathBuf::from("/tmp/other.pid"));
	}

	#[test]
	fn rejects_unknown_keys_and_bad_levels() {
		assert!(parse("[supervisor]\nprogram_dir = \"/x\"\n").is_err());
		assert!(parse("[nope]\n").is_err());
		let err = parse("[supervisor]\nlog_level = \"loud\"\n").unwrap_err();
		assert!(err.contains("loud"), "{}", err);
	}

	#[test]
	fn env_file_sits_under_defaults_environment() {
		let dir = std::env::temp_dir().join(format!("corral-config-{}", std::process::id()));
		let _ = std::fs::create_dir_all(&dir);
		let env_file = dir.join(".env");
		std::fs::write(&env_file, "TOKEN=secret\nREGION=eu\n").unwrap();

		let mut config = GlobalConfig::default();
		config.supervisor.env_file = Some(env_file);
		config.defaults.environment.insert("REGION".into(), "us".into());

		let env = config.supervisor_config().unwrap().defaults.environment;
		assert_eq!(env["TOKEN"], "secret");
		assert_eq!(env["REGION"], "us");

		config.supervisor.env_file = Some(dir.join("missing.env"));
		assert!(matches!(config.supervisor_config(), Err(SupervisorError::Config { .. })));

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn negative_durations_are_rejected() {
		let mut config = GlobalConfig::default();
		config.defaults.stopwaitsecs = -1.0;
		assert!(config.supervisor_config().is_err());
	}

	#[test]
	fn explicit_settings_file_must_exist() {
		let err = locate(Some(Path::new("/nonexistent/corral.toml"))).unwrap_err();
		assert!(err.contains("not found"));
	}
}
