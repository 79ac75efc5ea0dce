use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::output::Sink;

/// Which child stream a multiplexer is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
	Stdout,
	Stderr,
}

impl fmt::Display for Stream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Stream::Stdout => write!(f, "stdout"),
			Stream::Stderr => write!(f, "stderr"),
		}
	}
}

/// Splits a byte stream into lines and hands each line to every sink, in
/// registration order, before reading the next one.
#[derive(Clone)]
pub struct Multiplexer {
	prefix: Option<String>,
	sinks: Arc<[Arc<dyn Sink>]>,
}

impl Multiplexer {
	/// Every line is delivered as `[<name>] <line>`.
	pub fn annotated(name: &str, sinks: Arc<[Arc<dyn Sink>]>) -> Self {
		Self {
			prefix: Some(format!("[{}] ", name)),
			sinks,
		}
	}

	/// Lines are delivered unmodified.
	pub fn raw(sinks: Arc<[Arc<dyn Sink>]>) -> Self {
		Self { prefix: None, sinks }
	}

	pub fn deliver(&self, line: &str) {
		let annotated;
		let line = match &self.prefix {
			Some(prefix) => {
				annotated = format!("{}{}", prefix, line);
				annotated.as_str()
			}
			None => line,
		};

		for sink in self.sinks.iter() {
			if let Err(e) = sink.write_line(line) {
				debug!(error = %e, "sink rejected line");
			}
		}
	}

	/// Read `reader` to the end, returning the number of lines delivered.
	///
	/// A read error ends the stream early; it is logged and otherwise ignored,
	/// since truncated output does not fail the run. A final line without a
	/// trailing newline is still delivered. Invalid UTF-8 is replaced rather
	/// than dropped.
	pub async fn forward<R>(&self, reader: R, stream: Stream, label: &str) -> u64
	where
		R: AsyncRead + Unpin,
	{
		let mut reader = BufReader::new(reader);
		let mut buf = Vec::new();
		let mut delivered = 0;

		loop {
			buf.clear();
			match reader.read_until(b'\n', &mut buf).await {
				Ok(0) => break,
				Ok(_) => {
					let line = trim_line_ending(&buf);
					self.deliver(&String::from_utf8_lossy(line));
					delivered += 1;
				}
				Err(e) => {
					warn!(process = %label, %stream, error = %e, "stream error");
					break;
				}
			}
		}

		debug!(process = %label, %stream, lines = delivered, "stream closed");
		delivered
	}
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
	let line = line.strip_suffix(b"\n").unwrap_or(line);
	line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::output::OutputCapture;
	use std::io;
	use std::sync::Mutex;

	fn sinks(list: Vec<Arc<dyn Sink>>) -> Arc<[Arc<dyn Sink>]> {
		list.into()
	}

	#[tokio::test]
	async fn annotated_lines_are_prefixed() {
		let capture = OutputCapture::new();
		let mux = Multiplexer::annotated("web", sinks(vec![Arc::new(capture.clone())]));

		let n = mux.forward(&b"one\r\ntwo\nthree"[..], Stream::Stdout, "web").await;
		assert_eq!(n, 3);
		assert_eq!(capture.snapshot(), vec!["[web] one", "[web] two", "[web] three"]);
	}

	#[tokio::test]
	async fn raw_lines_are_untouched() {
		let capture = OutputCapture::new();
		let mux = Multiplexer::raw(sinks(vec![Arc::new(capture.clone())]));

		mux.forward(&b"[x] keep\n\n"[..], Stream::Stderr, "x").await;
		assert_eq!(capture.snapshot(), vec!["[x] keep", ""]);
	}

	#[tokio::test]
	async fn sinks_receive_lines_in_registration_order() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let first = {
			let order = Arc::clone(&order);
			move |line: &str| -> io::Result<()> {
				order.lock().unwrap().push(format!("first {}", line));
				Ok(())
			}
		};
		let second = {
			let order = Arc::clone(&order);
			move |line: &str| -> io::Result<()> {
				order.lock().unwrap().push(format!("second {}", line));
				Ok(())
			}
		};
		let mux = Multiplexer::raw(sinks(vec![Arc::new(first), Arc::new(second)]));

		mux.forward(&b"a\nb\n"[..], Stream::Stdout, "t").await;
		assert_eq!(
			*order.lock().unwrap(),
			vec!["first a", "second a", "first b", "second b"]
		);
	}

	#[tokio::test]
	async fn failing_sink_does_not_block_others() {
		let broken = |_: &str| -> io::Result<()> { Err(io::Error::new(io::ErrorKind::Other, "full")) };
		let capture = OutputCapture::new();
		let mux = Multiplexer::raw(sinks(vec![Arc::new(broken), Arc::new(capture.clone())]));

		assert_eq!(mux.forward(&b"a\nb\n"[..], Stream::Stdout, "t").await, 2);
		assert_eq!(capture.snapshot(), vec!["a", "b"]);
	}

	#[tokio::test]
	async fn invalid_utf8_is_replaced() {
		let capture = OutputCapture::new();
		let mux = Multiplexer::raw(sinks(vec![Arc::new(capture.clone())]));

		mux.forward(&b"ok \xff\n"[..], Stream::Stdout, "t").await;
		assert_eq!(capture.snapshot(), vec!["ok \u{fffd}"]);
	}
}
