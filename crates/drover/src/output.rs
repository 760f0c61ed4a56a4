use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::logs;

pub const DEFAULT_RING_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotation {
	pub max_size: u64,
	pub max_backups: u32,
}

impl Default for LogRotation {
	fn default() -> Self {
		Self {
			max_size: 10 * 1024 * 1024,
			max_backups: 5,
		}
	}
}

/// Append-only capture of one output stream.
///
/// Everything written lands in a bounded ring buffer; the log file is a
/// best-effort copy. If the file cannot be opened or written, the capture
/// keeps working from memory and reports the fallback once.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	ring_limit: usize,
	log_writer: Arc<Mutex<LogWriter>>,
	fallback: Arc<AtomicBool>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	rotation: LogRotation,
	fallback: Arc<AtomicBool>,
}

impl OutputCapture {
	pub fn new(path: &Path, rotation: LogRotation, ring_limit: usize) -> Self {
		let fallback = Arc::new(AtomicBool::new(false));
		let file = match open_log(path) {
			Ok(f) => Some(f),
			Err(e) => {
				tracing::warn!("log file {} unavailable ({}), keeping output in memory", path.display(), e);
				fallback.store(true, Ordering::SeqCst);
				None
			}
		};

		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		let ring_limit = ring_limit.max(1);

		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(ring_limit.min(DEFAULT_RING_SIZE)))),
			ring_limit,
			log_writer: Arc::new(Mutex::new(LogWriter {
				file,
				path: path.to_path_buf(),
				bytes_written,
				rotation,
				fallback: Arc::clone(&fallback),
			})),
			fallback,
		}
	}

	pub async fn write(&self, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			if data.len() >= self.ring_limit {
				ring.clear();
				ring.extend(&data[data.len() - self.ring_limit..]);
			} else {
				let overflow = (ring.len() + data.len()).saturating_sub(self.ring_limit);
				ring.drain(..overflow);
				ring.extend(data);
			}
		}

		{
			let mut writer = self.log_writer.lock().await;
			writer.write(data);
		}
	}

	/// Write one supervisor message line, prefixed so it stands out from child output.
	pub async fn note(&self, message: &str) {
		let line = format!("[corral] {}\n", message);
		self.write(line.as_bytes()).await;
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	/// True once the log file has been given up on.
	pub fn is_fallback(&self) -> bool {
		self.fallback.load(Ordering::SeqCst)
	}
}

impl LogWriter {
	fn write(&mut self, data: &[u8]) {
		let Some(ref mut file) = self.file else {
			return;
		};

		if let Err(e) = file.write_all(data) {
			self.give_up(&e);
			return;
		}

		self.bytes_written += data.len() as u64;
		if self.rotation.max_size > 0 && self.bytes_written >= self.rotation.max_size {
			self.rotate();
		}
	}

	fn rotate(&mut self) {
		if let Some(file) = self.file.take() {
			drop(file);
		}

		if let Err(e) = logs::rotate_backups(&self.path, self.rotation.max_backups) {
			tracing::warn!("failed to rotate {}: {}", self.path.display(), e);
		}

		match open_log(&self.path) {
			Ok(f) => {
				self.bytes_written = f.metadata().map(|m| m.len()).unwrap_or(0);
				self.file = Some(f);
			}
			Err(e) => self.give_up(&e),
		}
	}

	fn give_up(&mut self, e: &std::io::Error) {
		self.file = None;
		if !self.fallback.swap(true, Ordering::SeqCst) {
			tracing::warn!("writing {} failed ({}), keeping output in memory", self.path.display(), e);
		}
	}
}

fn open_log(path: &Path) -> std::io::Result<File> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("drover-output-{}-{}", std::process::id(), name));
		let _ = std::fs::remove_dir_all(&dir);
		std::fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[tokio::test]
	async fn writes_file_and_ring() {
		let dir = temp_dir("basic");
		let path = dir.join("web_out.log");
		let capture = OutputCapture::new(&path, LogRotation::default(), 1024);

		capture.write(b"hello\n").await;
		capture.note("web exited (exit 1)").await;

		let text = String::from_utf8(capture.snapshot().await).unwrap();
		assert_eq!(text, "hello\n[corral] web exited (exit 1)\n");
		assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
		assert!(!capture.is_fallback());

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn ring_is_bounded() {
		let dir = temp_dir("ring");
		let capture = OutputCapture::new(&dir.join("x.log"), LogRotation::default(), 4);
		capture.write(b"ab").await;
		capture.write(b"cdef").await;
		assert_eq!(capture.snapshot().await, b"cdef");
		capture.write(b"0123456789").await;
		assert_eq!(capture.snapshot().await, b"6789");
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn rotates_at_max_size() {
		let dir = temp_dir("rotate");
		let path = dir.join("x.log");
		let capture = OutputCapture::new(
			&path,
			LogRotation {
				max_size: 10,
				max_backups: 2,
			},
			1024,
		);

		capture.write(b"0123456789").await;
		capture.write(b"abc").await;

		assert_eq!(std::fs::read_to_string(logs::backup_path(&path, 1)).unwrap(), "0123456789");
		assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc");

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[tokio::test]
	async fn falls_back_to_memory_when_log_dir_is_unusable() {
		let dir = temp_dir("fallback");
		let blocker = dir.join("not-a-dir");
		std::fs::write(&blocker, "file in the way").unwrap();

		let capture = OutputCapture::new(&blocker.join("web_out.log"), LogRotation::default(), 1024);
		assert!(capture.is_fallback());

		capture.write(b"still here\n").await;
		assert_eq!(capture.snapshot().await, b"still here\n");

		let _ = std::fs::remove_dir_all(&dir);
	}
}
