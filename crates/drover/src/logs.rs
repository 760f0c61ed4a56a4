use std::path::{Path, PathBuf};

/// File name of the supervisor's own event log under the log root.
pub const EVENT_LOG_NAME: &str = "corral.log";

pub fn default_stdout_log(log_dir: &Path, process: &str) -> PathBuf {
	log_dir.join(format!("{}_out.log", file_safe(process)))
}

pub fn default_stderr_log(log_dir: &Path, process: &str) -> PathBuf {
	log_dir.join(format!("{}_err.log", file_safe(process)))
}

pub fn event_log_path(log_dir: &Path) -> PathBuf {
	log_dir.join(EVENT_LOG_NAME)
}

/// `web_out.log` -> `web_out.log.3`
pub fn backup_path(path: &Path, n: u32) -> PathBuf {
	let mut name = path.as_os_str().to_owned();
	name.push(format!(".{}", n));
	PathBuf::from(name)
}

/// Shift `x.log.1 .. x.log.N-1` up by one and move `x.log` to `x.log.1`.
/// The oldest backup falls off. With no backups the file is simply removed.
pub fn rotate_backups(path: &Path, max_backups: u32) -> std::io::Result<()> {
	if max_backups == 0 {
		return match std::fs::remove_file(path) {
			Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
			_ => Ok(()),
		};
	}

	let oldest = backup_path(path, max_backups);
	if oldest.exists() {
		std::fs::remove_file(&oldest)?;
	}
	for n in (1..max_backups).rev() {
		let from = backup_path(path, n);
		if from.exists() {
			std::fs::rename(&from, backup_path(path, n + 1))?;
		}
	}
	if path.exists() {
		std::fs::rename(path, backup_path(path, 1))?;
	}
	Ok(())
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
	let lines: Vec<&str> = text.lines().collect();
	let start = lines.len().saturating_sub(n);
	let mut out = lines[start..].join("\n");
	if !out.is_empty() {
		out.push('\n');
	}
	out
}

/// UTC `YYYY-MM-DD HH:MM:SS` for the event log.
pub fn timestamp() -> String {
	let now = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0);
	format_timestamp(now)
}

pub fn format_timestamp(secs: u64) -> String {
	let (year, month, day, hour, minute) = secs_to_datetime(secs);
	format!(
		"{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
		year,
		month,
		day,
		hour,
		minute,
		secs % 60
	)
}

pub fn secs_to_datetime(secs: u64) -> (u32, u32, u32, u32, u32) {
	let days = (secs / 86400) as i64;
	let time_of_day = secs % 86400;
	let hour = (time_of_day / 3600) as u32;
	let minute = ((time_of_day % 3600) / 60) as u32;

	let z = days + 719468;
	let era = if z >= 0 { z } else { z - 146096 } / 146097;
	let doe = (z - era * 146097) as u32;
	let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
	let y = yoe as i64 + era * 400;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let d = doy - (153 * mp + 2) / 5 + 1;
	let m = if mp < 10 { mp + 3 } else { mp - 9 };
	let y = if m <= 2 { y + 1 } else { y };

	(y as u32, m, d, hour, minute)
}

fn file_safe(process: &str) -> String {
	process
		.chars()
		.map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
		.collect()
}
