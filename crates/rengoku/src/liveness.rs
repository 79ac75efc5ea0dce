//! Polling fallback for exit detection.
//!
//! A [`Process`] learns about exits by waiting on its own child. These helpers
//! cover the cases where no such wait is available: a pid inherited from
//! elsewhere, or a caller that only holds a pid. They probe on a fixed
//! interval and fire once, on the first probe that finds the process gone.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::debug;

use crate::process::Process;
use crate::types::Exited;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Whether `pid` names a live process. Zombies count as exited.
pub fn is_alive(pid: u32) -> bool {
	// 0 and negative values address process groups, not a single process
	let raw = match i32::try_from(pid) {
		Ok(raw) if raw > 0 => raw,
		_ => return false,
	};
	match signal::kill(Pid::from_raw(raw), None) {
		Ok(()) => !is_zombie(pid),
		// exists, owned by someone else
		Err(Errno::EPERM) => true,
		Err(_) => false,
	}
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
	let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
		return false;
	};
	// the command name may contain spaces or parens; the state follows the last ')'
	stat.rfind(')')
		.and_then(|i| stat[i + 1..].split_whitespace().next())
		.map(|state| state == "Z")
		.unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
	false
}

/// Poll `pid` every `interval` until it is gone.
///
/// Must be called from within a Tokio runtime. Polling stops early once every
/// clone of the returned notification has been dropped.
pub fn watch_pid(pid: u32, interval: Duration) -> Exited {
	let (tx, rx) = watch::channel(0);
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		loop {
			ticker.tick().await;
			if tx.is_closed() {
				return;
			}
			if !is_alive(pid) {
				debug!(pid, "process gone");
				tx.send_replace(1);
				return;
			}
		}
	});
	Exited::new(rx, 1)
}

impl Process {
	/// Liveness by polling instead of waiting: fires once the handle records
	/// an exit, the attached pid changes, or the pid stops answering probes.
	/// Fires on the first tick when nothing is attached.
	pub fn poll_liveness(&self, interval: Duration) -> Exited {
		let process = self.clone();
		let pid = self.pid();
		let (tx, rx) = watch::channel(0);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				ticker.tick().await;
				if tx.is_closed() {
					return;
				}
				let gone = match pid {
					Some(pid) => process.pid() != Some(pid) || !is_alive(pid),
					None => true,
				};
				if gone {
					debug!(process = %process, "liveness probe found process gone");
					tx.send_replace(1);
					return;
				}
			}
		});
		Exited::new(rx, 1)
	}

	/// Whether a child is attached and answering probes.
	pub fn is_running(&self) -> bool {
		self.pid().map(is_alive).unwrap_or(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn own_process_is_alive() {
		assert!(is_alive(std::process::id()));
	}

	#[test]
	fn group_and_out_of_range_pids_are_not_alive() {
		assert!(!is_alive(0));
		assert!(!is_alive(u32::MAX));
	}
}
