use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::Signal;

/// Errors from constructing, starting, signalling, or waiting on a process.
///
/// Construction, start, runtime and signal-delivery failures are separate
/// variants so a failed launch can never be mistaken for a child that started
/// and then exited non-zero.
#[derive(Debug, Clone)]
pub enum Error {
	/// The command string was empty or whitespace only.
	InvalidCommand(String),
	/// The first token of the command did not resolve to an executable.
	ExecutableNotFound(String),
	/// The OS refused to start the process or set up its pipes.
	Spawn { binary: PathBuf, source: Arc<io::Error> },
	/// `execute` was called while a previous run is still in flight.
	AlreadyRunning,
	/// Waiting on the child failed.
	Wait(Arc<io::Error>),
	/// The child ran and exited unsuccessfully.
	Exited(ExitStatus),
	/// A signal could not be delivered.
	Signal { signal: Signal, errno: Errno },
	/// `stop` was called with no run in progress.
	NotRunning,
	/// `stop` was already called for the current run.
	StopAlreadyRequested,
}

impl Error {
	pub(crate) fn spawn(binary: impl Into<PathBuf>, source: io::Error) -> Self {
		Error::Spawn {
			binary: binary.into(),
			source: Arc::new(source),
		}
	}

	/// Exit code of an unsuccessful run, if the child exited rather than
	/// being killed by a signal.
	pub fn exit_code(&self) -> Option<i32> {
		match self {
			Error::Exited(status) => status.code(),
			_ => None,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InvalidCommand(cmd) => write!(f, "invalid command: {:?}", cmd),
			Error::ExecutableNotFound(program) => {
				write!(f, "executable not found in PATH: {}", program)
			}
			Error::Spawn { binary, source } => {
				write!(f, "failed to start {}: {}", binary.display(), source)
			}
			Error::AlreadyRunning => write!(f, "process is already running"),
			Error::Wait(e) => write!(f, "failed waiting on process: {}", e),
			Error::Exited(status) => write!(f, "process exited unsuccessfully: {}", status),
			Error::Signal { signal, errno } => write!(f, "failed to send {}: {}", signal, errno),
			Error::NotRunning => write!(f, "process is not running"),
			Error::StopAlreadyRequested => write!(f, "stop already requested for this run"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Spawn { source, .. } => Some(source.as_ref()),
			Error::Wait(e) => Some(e.as_ref()),
			Error::Signal { errno, .. } => Some(errno),
			_ => None,
		}
	}
}

