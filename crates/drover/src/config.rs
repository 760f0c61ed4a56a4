//! Program definition files.
//!
//! A programs directory holds `*.toml` files, each with one or more
//! `[program.<name>]` tables. Files load in file-name order, programs within a
//! file in name order.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SupervisorError;
use crate::logs;
use crate::types::{ProcessSpec, RestartPolicy};

/// Values used for any field a program table leaves out.
#[derive(Debug, Clone)]
pub struct Defaults {
	pub log_dir: PathBuf,
	pub autostart: bool,
	pub autorestart: RestartPolicy,
	pub start_retries: u32,
	pub start_grace: Duration,
	pub stop_timeout: Duration,
	pub environment: BTreeMap<String, String>,
}

impl Default for Defaults {
	fn default() -> Self {
		Self {
			log_dir: PathBuf::from("/var/log/corral"),
			autostart: true,
			autorestart: RestartPolicy::OnFailure,
			start_retries: 3,
			start_grace: Duration::from_secs(1),
			stop_timeout: Duration::from_secs(10),
			environment: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
	#[serde(default)]
	program: BTreeMap<String, ProgramEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramEntry {
	command: String,
	directory: Option<PathBuf>,
	autostart: Option<bool>,
	autorestart: Option<AutorestartValue>,
	startretries: Option<u32>,
	startsecs: Option<f64>,
	stopwaitsecs: Option<f64>,
	stdout_logfile: Option<PathBuf>,
	stderr_logfile: Option<PathBuf>,
	#[serde(default)]
	environment: BTreeMap<String, String>,
	#[serde(default)]
	depends_on: Vec<String>,
}

/// supervisord accepts `autorestart = true/false` as well as a policy name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AutorestartValue {
	Flag(bool),
	Policy(RestartPolicy),
}

impl AutorestartValue {
	fn policy(&self) -> RestartPolicy {
		match self {
			AutorestartValue::Flag(true) => RestartPolicy::Always,
			AutorestartValue::Flag(false) => RestartPolicy::Never,
			AutorestartValue::Policy(p) => *p,
		}
	}
}

/// Load and validate every definition file in `dir`.
pub fn load_dir(dir: &Path, defaults: &Defaults) -> Result<Vec<ProcessSpec>, SupervisorError> {
	let entries = std::fs::read_dir(dir)
		.map_err(|e| SupervisorError::config(dir, format!("cannot read programs directory: {}", e)))?;

	let mut files: Vec<PathBuf> = entries
		.flatten()
		.map(|entry| entry.path())
		.filter(|path| path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("toml"))
		.collect();
	files.sort();

	let mut specs = Vec::new();
	for path in &files {
		let content = std::fs::read_to_string(path)
			.map_err(|e| SupervisorError::config(path, format!("cannot read: {}", e)))?;
		specs.extend(parse_definitions(&content, path, defaults)?);
	}

	validate(&specs)?;
	tracing::debug!("loaded {} program(s) from {} file(s) in {}", specs.len(), files.len(), dir.display());
	Ok(specs)
}

/// Parse one definition file. Cross-file checks happen in [`validate`].
pub fn parse_definitions(
	content: &str,
	source: &Path,
	defaults: &Defaults,
) -> Result<Vec<ProcessSpec>, SupervisorError> {
	let file: DefinitionFile =
		toml::from_str(content).map_err(|e| SupervisorError::config(source, e.to_string().trim().to_string()))?;

	let base_dir = source.parent().unwrap_or_else(|| Path::new("."));
	let mut specs = Vec::with_capacity(file.program.len());

	for (name, entry) in file.program {
		if !valid_name(&name) {
			return Err(SupervisorError::config(
				source,
				format!("invalid program name `{}` (use letters, digits, '-', '_' or '.')", name),
			));
		}
		if entry.command.trim().is_empty() {
			return Err(SupervisorError::config(source, format!("program `{}` has an empty command", name)));
		}

		let start_grace = match entry.startsecs {
			Some(secs) => seconds(secs, "startsecs", &name, source)?,
			None => defaults.start_grace,
		};
		let stop_timeout = match entry.stopwaitsecs {
			Some(secs) => seconds(secs, "stopwaitsecs", &name, source)?,
			None => defaults.stop_timeout,
		};

		let mut environment = defaults.environment.clone();
		environment.extend(entry.environment);

		let stdout_logfile = match entry.stdout_logfile {
			Some(p) => resolve_under(&defaults.log_dir, p),
			None => logs::default_stdout_log(&defaults.log_dir, &name),
		};
		let stderr_logfile = match entry.stderr_logfile {
			Some(p) => resolve_under(&defaults.log_dir, p),
			None => logs::default_stderr_log(&defaults.log_dir, &name),
		};

		specs.push(ProcessSpec {
			command: entry.command,
			directory: entry.directory.map(|d| resolve_under(base_dir, d)),
			environment,
			autostart: entry.autostart.unwrap_or(defaults.autostart),
			autorestart: entry.autorestart.map(|a| a.policy()).unwrap_or(defaults.autorestart),
			start_retries: entry.startretries.unwrap_or(defaults.start_retries),
			start_grace,
			stop_timeout,
			depends_on: entry.depends_on,
			stdout_logfile,
			stderr_logfile,
			source: source.to_path_buf(),
			name,
		});
	}

	Ok(specs)
}

/// Check a whole program set: unique names, known dependencies, no cycles.
pub fn validate(specs: &[ProcessSpec]) -> Result<(), SupervisorError> {
	let mut seen: HashMap<&str, &Path> = HashMap::new();
	for spec in specs {
		if let Some(first) = seen.insert(spec.name.as_str(), spec.source.as_path()) {
			return Err(SupervisorError::config(
				&spec.source,
				format!("program `{}` is already defined in {}", spec.name, first.display()),
			));
		}
	}

	for spec in specs {
		for dep in &spec.depends_on {
			if dep == &spec.name {
				return Err(SupervisorError::config(
					&spec.source,
					format!("program `{}` depends on itself", spec.name),
				));
			}
			if !seen.contains_key(dep.as_str()) {
				return Err(SupervisorError::config(
					&spec.source,
					format!("program `{}` depends on unknown program `{}`", spec.name, dep),
				));
			}
		}
	}

	dependency_levels(specs).map(|_| ())
}

/// Group programs so that every program comes after all of its dependencies.
/// Programs in the same level keep their load order and can start together.
pub fn dependency_levels<'a>(specs: &'a [ProcessSpec]) -> Result<Vec<Vec<String>>, SupervisorError> {
	let mut level: HashMap<&'a str, usize> = HashMap::new();
	let mut remaining: Vec<&'a ProcessSpec> = specs.iter().collect();

	while !remaining.is_empty() {
		let before = remaining.len();
		remaining.retain(|spec| {
			let spec: &'a ProcessSpec = *spec;
			let resolved = spec
				.depends_on
				.iter()
				.try_fold(0usize, |acc, dep| level.get(dep.as_str()).map(|l| acc.max(l + 1)));
			match resolved {
				Some(l) => {
					level.insert(spec.name.as_str(), l);
					false
				}
				None => true,
			}
		});
		if remaining.len() == before {
			let names: Vec<&str> = remaining.iter().map(|s| s.name.as_str()).collect();
			return Err(SupervisorError::Config {
				path: None,
				message: format!("dependency cycle or unknown dependency among: {}", names.join(", ")),
			});
		}
	}

	let depth = level.values().copied().max().map(|m| m + 1).unwrap_or(0);
	let mut levels = vec![Vec::new(); depth];
	for spec in specs {
		if let Some(l) = level.get(spec.name.as_str()) {
			levels[*l].push(spec.name.clone());
		}
	}
	Ok(levels)
}

/// Read a dotenv-style file. A malformed line fails the whole file.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, SupervisorError> {
	let iter = dotenvy::from_path_iter(path)
		.map_err(|e| SupervisorError::config(path, format!("cannot read env file: {}", e)))?;
	let mut vars = BTreeMap::new();
	for item in iter {
		let (key, value) = item.map_err(|e| SupervisorError::config(path, format!("bad env file entry: {}", e)))?;
		vars.insert(key, value);
	}
	Ok(vars)
}

pub fn valid_name(name: &str) -> bool {
	!name.is_empty()
		&& name
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn seconds(value: f64, field: &str, name: &str, source: &Path) -> Result<Duration, SupervisorError> {
	Duration::try_from_secs_f64(value).map_err(|_| {
		SupervisorError::config(
			source,
			format!("program `{}`: {} must be a non-negative number of seconds", name, field),
		)
	})
}

fn resolve_under(base: &Path, path: PathBuf) -> PathBuf {
	if path.is_absolute() {
		path
	} else {
		base.join(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn defaults() -> Defaults {
		Defaults {
			log_dir: PathBuf::from("/logs"),
			..Defaults::default()
		}
	}

	fn parse(content: &str) -> Result<Vec<ProcessSpec>, SupervisorError> {
		parse_definitions(content, Path::new("/etc/corral/conf.d/app.toml"), &defaults())
	}

	#[test]
	fn parses_full_program() {
		let specs = parse(
			r#"
[program.web]
command = "python3 cluster.py"
directory = "/app"
autostart = false
autorestart = "always"
startretries = 5
startsecs = 0.5
stopwaitsecs = 3
stdout_logfile = "web.out"
stderr_logfile = "/tmp/web.err"
depends_on = ["redis"]

[program.web.environment]
PYTHONUNBUFFERED = "1"
"#,
		)
		.unwrap();

		assert_eq!(specs.len(), 1);
		let web = &specs[0];
		assert_eq!(web.name, "web");
		assert_eq!(web.command, "python3 cluster.py");
		assert_eq!(web.directory, Some(PathBuf::from("/app")));
		assert!(!web.autostart);
		assert_eq!(web.autorestart, RestartPolicy::Always);
		assert_eq!(web.start_retries, 5);
		assert_eq!(web.start_grace, Duration::from_millis(500));
		assert_eq!(web.stop_timeout, Duration::from_secs(3));
		assert_eq!(web.stdout_logfile, PathBuf::from("/logs/web.out"));
		assert_eq!(web.stderr_logfile, PathBuf::from("/tmp/web.err"));
		assert_eq!(web.depends_on, vec!["redis".to_string()]);
		assert_eq!(web.environment.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
	}

	#[test]
	fn applies_defaults() {
		let specs = parse("[program.worker]\ncommand = \"sleep 1\"\n").unwrap();
		let worker = &specs[0];
		assert!(worker.autostart);
		assert_eq!(worker.autorestart, RestartPolicy::OnFailure);
		assert_eq!(worker.start_retries, 3);
		assert_eq!(worker.stdout_logfile, PathBuf::from("/logs/worker_out.log"));
		assert_eq!(worker.stderr_logfile, PathBuf::from("/logs/worker_err.log"));
		assert_eq!(worker.directory, None);
	}

	#[test]
	fn relative_directory_resolves_next_to_file() {
		let specs = parse("[program.a]\ncommand = \"true\"\ndirectory = \"app\"\n").unwrap();
		assert_eq!(specs[0].directory, Some(PathBuf::from("/etc/corral/conf.d/app")));
	}

	#[test]
	fn autorestart_accepts_supervisord_values() {
		let specs = parse(
			r#"
[program.a]
command = "true"
autorestart = true
[program.b]
command = "true"
autorestart = false
[program.c]
command = "true"
autorestart = "unexpected"
"#,
		)
		.unwrap();
		let policies: Vec<_> = specs.iter().map(|s| s.autorestart).collect();
		assert_eq!(
			policies,
			vec![RestartPolicy::Always, RestartPolicy::Never, RestartPolicy::OnFailure]
		);
	}

	#[test]
	fn default_environment_is_overridden_per_program() {
		let mut d = defaults();
		d.environment.insert("MODE".into(), "prod".into());
		d.environment.insert("KEEP".into(), "yes".into());
		let specs = parse_definitions(
			"[program.a]\ncommand = \"true\"\nenvironment = { MODE = \"dev\" }\n",
			Path::new("a.toml"),
			&d,
		)
		.unwrap();
		assert_eq!(specs[0].environment.get("MODE").map(String::as_str), Some("dev"));
		assert_eq!(specs[0].environment.get("KEEP").map(String::as_str), Some("yes"));
	}

	#[test]
	fn rejects_malformed_files() {
		assert!(matches!(parse("[program.a]\n"), Err(SupervisorError::Config { .. })));
		assert!(matches!(
			parse("[program.a]\ncommand = \"x\"\nautorestart = \"sometimes\"\n"),
			Err(SupervisorError::Config { .. })
		));
		assert!(matches!(
			parse("[program.a]\ncommand = \"x\"\ncolour = \"blue\"\n"),
			Err(SupervisorError::Config { .. })
		));
		assert!(matches!(parse("[program.a]\ncommand = \"  \"\n"), Err(SupervisorError::Config { .. })));
		assert!(matches!(
			parse("[program.\"has space\"]\ncommand = \"x\"\n"),
			Err(SupervisorError::Config { .. })
		));
		assert!(matches!(
			parse("[program.a]\ncommand = \"x\"\nstartsecs = -1\n"),
			Err(SupervisorError::Config { .. })
		));
	}

	#[test]
	fn duplicate_names_across_files_are_rejected() {
		let mut specs = parse_definitions("[program.web]\ncommand = \"a\"\n", Path::new("one.toml"), &defaults()).unwrap();
		specs.extend(parse_definitions("[program.web]\ncommand = \"b\"\n", Path::new("two.toml"), &defaults()).unwrap());
		let err = validate(&specs).unwrap_err();
		assert!(err.to_string().contains("already defined in one.toml"), "{}", err);
	}

	#[test]
	fn unknown_and_cyclic_dependencies_are_rejected() {
		let unknown = parse("[program.a]\ncommand = \"x\"\ndepends_on = [\"ghost\"]\n").unwrap();
		assert!(validate(&unknown).unwrap_err().to_string().contains("unknown program `ghost`"));

		let cyclic = parse(
			"[program.a]\ncommand = \"x\"\ndepends_on = [\"b\"]\n[program.b]\ncommand = \"x\"\ndepends_on = [\"a\"]\n",
		)
		.unwrap();
		assert!(validate(&cyclic).unwrap_err().to_string().contains("cycle"));

		let selfish = parse("[program.a]\ncommand = \"x\"\ndepends_on = [\"a\"]\n").unwrap();
		assert!(validate(&selfish).is_err());
	}

	#[test]
	fn levels_follow_dependencies() {
		let specs = parse(
			r#"
[program.api]
command = "x"
depends_on = ["db", "cache"]
[program.cache]
command = "x"
[program.db]
command = "x"
[program.worker]
command = "x"
depends_on = ["api"]
"#,
		)
		.unwrap();
		let levels = dependency_levels(&specs).unwrap();
		assert_eq!(
			levels,
			vec![
				vec!["cache".to_string(), "db".to_string()],
				vec!["api".to_string()],
				vec!["worker".to_string()],
			]
		);
	}

	fn env_file(name: &str, content: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("drover-env-{}-{}", std::process::id(), name));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join(".env");
		std::fs::write(&path, content).unwrap();
		path
	}

	#[test]
	fn env_file_loading() {
		let path = env_file(
			"ok",
			"# comment\nTOKEN=abc\nexport REGION=eu-west\nQUOTED=\"a b\"\nSINGLE='x'\n\nEMPTY=\n",
		);
		let vars = load_env_file(&path).unwrap();
		assert_eq!(vars.get("TOKEN").map(String::as_str), Some("abc"));
		assert_eq!(vars.get("REGION").map(String::as_str), Some("eu-west"));
		assert_eq!(vars.get("QUOTED").map(String::as_str), Some("a b"));
		assert_eq!(vars.get("SINGLE").map(String::as_str), Some("x"));
		assert_eq!(vars.get("EMPTY").map(String::as_str), Some(""));
		let _ = std::fs::remove_dir_all(path.parent().unwrap());
	}

	#[test]
	fn env_file_errors_are_config_errors() {
		let path = env_file("bad", "NOEQUALS\n");
		assert!(matches!(load_env_file(&path), Err(SupervisorError::Config { .. })));
		let _ = std::fs::remove_dir_all(path.parent().unwrap());

		let missing = std::env::temp_dir().join("drover-env-missing/.env");
		assert!(matches!(load_env_file(&missing), Err(SupervisorError::Config { .. })));
	}

	#[test]
	fn name_validation() {
		assert!(valid_name("web"));
		assert!(valid_name("bot_1.worker-2"));
		assert!(!valid_name(""));
		assert!(!valid_name("two words"));
		assert!(!valid_name("a/b"));
	}
}
