use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::lock;
use crate::output::Sink;

/// Append-only log file for one process, rotated once it grows past
/// `max_size` bytes.
///
/// The live file is `<dir>/<process> <yy-mmdd>.log`; rotated files gain the
/// hour (and the minute, if that name is taken).
pub struct LogFile {
	writer: Mutex<LogWriter>,
}

struct LogWriter {
	file: Option<File>,
	path: PathBuf,
	bytes_written: u64,
	max_size: u64,
	dir: PathBuf,
	process: String,
}

impl LogFile {
	pub fn open(dir: &Path, process: &str, max_size: u64) -> io::Result<Self> {
		fs::create_dir_all(dir)?;
		let path = dir.join(current_log_name(process));
		let file = open_append(&path)?;
		let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);

		Ok(Self {
			writer: Mutex::new(LogWriter {
				file: Some(file),
				path,
				bytes_written,
				max_size,
				dir: dir.to_path_buf(),
				process: process.to_string(),
			}),
		})
	}

	pub fn path(&self) -> PathBuf {
		lock(&self.writer).path.clone()
	}
}

impl Sink for LogFile {
	fn write_line(&self, line: &str) -> io::Result<()> {
		lock(&self.writer).write(line)
	}
}

impl LogWriter {
	fn write(&mut self, line: &str) -> io::Result<()> {
		// a failed reopen during rotation is retried on the next line
		if self.file.is_none() {
			self.file = Some(open_append(&self.path)?);
		}
		let file = match self.file.as_mut() {
			Some(f) => f,
			None => return Err(io::Error::new(io::ErrorKind::Other, "log file is closed")),
		};
		file.write_all(line.as_bytes())?;
		file.write_all(b"\n")?;
		self.bytes_written += line.len() as u64 + 1;

		if self.max_size > 0 && self.bytes_written >= self.max_size {
			self.rotate()?;
		}
		Ok(())
	}

	fn rotate(&mut self) -> io::Result<()> {
		drop(self.file.take());

		let rotated = self.dir.join(rotated_log_name(&self.dir, &self.process));
		if let Err(e) = fs::rename(&self.path, &rotated) {
			warn!(log = %self.path.display(), error = %e, "log rotation failed; starting a fresh file");
		}

		self.path = self.dir.join(current_log_name(&self.process));
		self.bytes_written = 0;
		self.file = Some(open_append(&self.path)?);
		Ok(())
	}
}

fn open_append(path: &Path) -> io::Result<File> {
	OpenOptions::new().create(true).append(true).open(path)
}

pub fn current_log_name(process: &str) -> String {
	let (date, _, _) = now_ymdhm();
	format!("{} {}.log", process, date)
}

/// First free name among `<date> <HH>.log`, `<date> <HH>.<MM>.log`, then
/// `<date> <HH>.<MM>-<n>.log`.
pub fn rotated_log_name(dir: &Path, process: &str) -> String {
	let (date, hour, minute) = now_ymdhm();
	let hourly = format!("{} {} {}.log", process, date, hour);
	if !dir.join(&hourly).exists() {
		return hourly;
	}

	let base = format!("{} {} {}.{}", process, date, hour, minute);
	let mut candidate = format!("{}.log", base);
	let mut n = 1;
	while dir.join(&candidate).exists() {
		candidate = format!("{}-{}.log", base, n);
		n += 1;
	}
	candidate
}

/// Civil date and time (UTC) for a Unix timestamp.
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

fn now_ymdhm() -> (String, String, String) {
	let now = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0);
	let (year, month, day, hour, minute) = secs_to_datetime(now);
	(
		format!("{:02}-{:02}{:02}", year % 100, month, day),
		format!("{:02}", hour),
		format!("{:02}", minute),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_dir(name: &str) -> PathBuf {
		let n = COUNTER.fetch_add(1, Ordering::SeqCst);
		std::env::temp_dir().join(format!("rengoku-logs-{}-{}-{}", std::process::id(), n, name))
	}

	#[test]
	fn test_secs_to_datetime() {
		let (y, m, d, h, min) = secs_to_datetime(1771027200);
		assert_eq!((y, m, d, h, min), (2026, 2, 14, 0, 0));
		assert_eq!(secs_to_datetime(0), (1970, 1, 1, 0, 0));
	}

	#[test]
	fn test_current_log_name() {
		let name = current_log_name("web");
		assert!(name.starts_with("web "));
		assert!(name.ends_with(".log"));
	}

	#[test]
	fn log_file_appends_lines() {
		let dir = temp_dir("append");
		let log = LogFile::open(&dir, "web", 0).unwrap();
		log.write_line("[web] one").unwrap();
		log.write_line("[web] two").unwrap();

		let text = fs::read_to_string(log.path()).unwrap();
		assert_eq!(text, "[web] one\n[web] two\n");
		let _ = fs::remove_dir_all(&dir);
	}

	#[test]
	fn log_file_rotates_past_max_size() {
		let dir = temp_dir("rotate");
		let log = LogFile::open(&dir, "web", 8).unwrap();
		log.write_line("0123456789").unwrap();
		log.write_line("after").unwrap();

		let files = fs::read_dir(&dir).unwrap().flatten().count();
		assert_eq!(files, 2);
		assert_eq!(fs::read_to_string(log.path()).unwrap(), "after\n");
		let _ = fs::remove_dir_all(&dir);
	}

	#[test]
	fn repeated_rotations_never_overwrite() {
		let dir = temp_dir("many");
		let log = LogFile::open(&dir, "web", 4).unwrap();
		for line in ["aaaa", "bbbb", "cccc", "dddd"] {
			log.write_line(line).unwrap();
		}

		let mut contents: Vec<String> = fs::read_dir(&dir)
			.unwrap()
			.flatten()
			.map(|e| fs::read_to_string(e.path()).unwrap())
			.collect();
		contents.sort();
		assert_eq!(contents, vec!["", "aaaa\n", "bbbb\n", "cccc\n", "dddd\n"]);
		let _ = fs::remove_dir_all(&dir);
	}

	#[test]
	fn logging_survives_a_deleted_live_file() {
		let dir = temp_dir("deleted");
		let log = LogFile::open(&dir, "web", 16).unwrap();
		fs::remove_file(log.path()).unwrap();

		log.write_line("0123456789abcdef").unwrap();
		log.write_line("after").unwrap();
		log.write_line("more").unwrap();

		assert_eq!(fs::read_to_string(log.path()).unwrap(), "after\nmore\n");
		let _ = fs::remove_dir_all(&dir);
	}
}
