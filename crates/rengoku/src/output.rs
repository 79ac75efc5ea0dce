use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::lock;

const DEFAULT_CAPTURE_LINES: usize = 4096;

/// Anything that accepts a line of child output.
///
/// Lines arrive without their trailing newline. Errors are reported back to
/// the multiplexer, which logs them and moves on to the next sink.
pub trait Sink: Send + Sync {
	fn write_line(&self, line: &str) -> io::Result<()>;
}

impl<F> Sink for F
where
	F: Fn(&str) -> io::Result<()> + Send + Sync,
{
	fn write_line(&self, line: &str) -> io::Result<()> {
		self(line)
	}
}

/// The parent's standard output.
pub struct Stdout;

impl Sink for Stdout {
	fn write_line(&self, line: &str) -> io::Result<()> {
		writeln!(io::stdout().lock(), "{}", line)
	}
}

/// The parent's standard error.
pub struct Stderr;

impl Sink for Stderr {
	fn write_line(&self, line: &str) -> io::Result<()> {
		writeln!(io::stderr().lock(), "{}", line)
	}
}

/// Adapts any `io::Write` into a sink, one newline-terminated line per call.
pub struct WriterSink<W> {
	inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
	pub fn new(writer: W) -> Self {
		Self {
			inner: Mutex::new(writer),
		}
	}

	pub fn into_inner(self) -> W {
		self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
	}
}

impl<W: Write + Send> Sink for WriterSink<W> {
	fn write_line(&self, line: &str) -> io::Result<()> {
		let mut w = lock(&self.inner);
		writeln!(w, "{}", line)?;
		w.flush()
	}
}

/// In-memory capture: keeps the most recent lines and fans each line out to
/// live subscribers.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<String>>>,
	capacity: usize,
	sender: broadcast::Sender<String>,
}

impl OutputCapture {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CAPTURE_LINES)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		let (sender, _) = broadcast::channel(256);
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPTURE_LINES)))),
			capacity,
			sender,
		}
	}

	pub fn snapshot(&self) -> Vec<String> {
		lock(&self.ring).iter().cloned().collect()
	}

	/// Captured lines joined with newlines.
	pub fn text(&self) -> String {
		let ring = lock(&self.ring);
		let mut out = String::new();
		for line in ring.iter() {
			out.push_str(line);
			out.push('\n');
		}
		out
	}

	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.sender.subscribe()
	}
}

impl Default for OutputCapture {
	fn default() -> Self {
		Self::new()
	}
}

impl Sink for OutputCapture {
	fn write_line(&self, line: &str) -> io::Result<()> {
		{
			let mut ring = lock(&self.ring);
			if ring.len() >= self.capacity {
				ring.pop_front();
			}
			ring.push_back(line.to_string());
		}

		// no subscribers is fine
		let _ = self.sender.send(line.to_string());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capture_keeps_most_recent_lines() {
		let capture = OutputCapture::with_capacity(2);
		for line in ["one", "two", "three"] {
			capture.write_line(line).unwrap();
		}
		assert_eq!(capture.snapshot(), vec!["two", "three"]);
		assert_eq!(capture.text(), "two\nthree\n");
	}

	#[test]
	fn capture_broadcasts_to_subscribers() {
		let capture = OutputCapture::new();
		let mut rx = capture.subscribe();
		capture.write_line("hello").unwrap();
		assert_eq!(rx.try_recv().unwrap(), "hello");
	}

	#[test]
	fn writer_sink_terminates_lines() {
		let sink = WriterSink::new(Vec::new());
		sink.write_line("a").unwrap();
		sink.write_line("b").unwrap();
		assert_eq!(sink.into_inner(), b"a\nb\n");
	}

	#[test]
	fn closures_are_sinks() {
		let seen = Mutex::new(Vec::new());
		let sink = |line: &str| -> io::Result<()> {
			seen.lock().unwrap().push(line.to_uppercase());
			Ok(())
		};
		sink.write_line("x").unwrap();
		assert_eq!(*seen.lock().unwrap(), vec!["X"]);
	}
}
