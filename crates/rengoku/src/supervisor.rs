use tracing::{debug, error, info};

use crate::operation::Operation;
use crate::process::Process;
use crate::types::StopState;

impl Process {
	/// Keep the command alive: launch it, and launch it again every time it
	/// exits, until `op` is cancelled or [`Process::stop`] is called.
	///
	/// There is no backoff and no restart limit; bound the loop by cancelling
	/// `op`. A failed launch is recorded (see [`Process::error`]) and ends the
	/// loop without retrying. On cancellation the loop returns without waiting
	/// for the child to be reaped; wait on [`Process::exited`] for that.
	pub async fn execute_and_restart(&self, op: &Operation) {
		self.set_supervised(true);
		let mut stop = self.stop_watch();
		let mut fresh = true;

		loop {
			match self.launch(op, fresh) {
				Ok(true) => {}
				Ok(false) => break,
				Err(err) => {
					error!(process = %self, error = %err, "launch failed; not restarting");
					self.record_error(err);
					break;
				}
			}
			fresh = false;

			let mut exited = self.exited();
			tokio::select! {
				_ = op.cancelled() => {
					debug!(process = %self, "operation cancelled; supervision ends");
					break;
				}
				_ = async { stop.wait_for(|s| *s != StopState::NotRequested).await.is_ok() } => {
					debug!(process = %self, "stop requested; supervision ends");
					break;
				}
				_ = exited.wait() => {}
			}

			// an exit caused by stop or cancel must not be restarted
			if op.is_cancelled() || *stop.borrow() != StopState::NotRequested {
				break;
			}
			info!(process = %self, runs = self.runs(), error = ?self.error(), "exited; restarting");
		}

		self.set_supervised(false);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use tokio::time::timeout;

	use super::*;
	use crate::output::{OutputCapture, Sink};

	fn quiet(name: &str, command: &str) -> Process {
		let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(OutputCapture::new())];
		Process::new(name, command, sinks).unwrap()
	}

	#[tokio::test]
	async fn pending_stop_vetoes_relaunch() {
		let process = quiet("short", "true");
		let op = Operation::new();

		assert!(process.launch(&op, true).unwrap());
		timeout(Duration::from_secs(5), process.exited().wait()).await.unwrap();

		// between runs of a restart loop
		process.set_supervised(true);
		process.stop().await.unwrap();
		assert!(!process.launch(&op, false).unwrap());
		assert_eq!(process.runs(), 1);

		// a fresh execute clears the request
		assert!(process.launch(&op, true).unwrap());
		timeout(Duration::from_secs(5), process.exited().wait()).await.unwrap();
		assert_eq!(process.runs(), 2);
	}
}
