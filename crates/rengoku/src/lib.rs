//! # rengoku
//!
//! Process supervisor for Rust CLIs.
//!
//! Launch an external command, stream its stdout/stderr line by line to any
//! number of sinks, stop it gracefully (SIGTERM, then SIGKILL after a grace
//! period) or forcefully on cancellation, and optionally restart it every
//! time it exits.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rengoku::{Operation, OutputCapture, Process};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let capture = OutputCapture::new();
//! let proc = Process::new("echo-test", "echo hello", vec![Arc::new(capture.clone())]).unwrap();
//!
//! let op = Operation::with_timeout(Duration::from_secs(5));
//! proc.execute(&op).await.unwrap();
//! proc.exited().wait().await;
//!
//! assert_eq!(capture.snapshot(), vec!["[echo-test] hello"]);
//! assert!(proc.error().is_none());
//! # }
//! ```

pub mod command;
pub mod error;
pub mod liveness;
pub mod logs;
pub mod operation;
pub mod output;
pub mod process;
pub mod stream;
pub mod supervisor;
pub mod types;

pub use command::CommandLine;
pub use error::Error;
pub use logs::LogFile;
pub use operation::Operation;
pub use output::{OutputCapture, Sink, Stderr, Stdout, WriterSink};
pub use process::{Input, Process, DEFAULT_GRACE_PERIOD};
pub use stream::{Multiplexer, Stream};
pub use types::{Exited, ProcessState};

pub use nix::sys::signal::Signal;

use std::sync::{Mutex, MutexGuard};

/// Lock, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(|e| e.into_inner())
}
