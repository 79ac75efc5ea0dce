use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A cancellable unit of work with an optional deadline.
///
/// Cloning yields another handle to the same operation; cancelling any clone
/// cancels all of them. Cancellation is sticky and cannot be undone.
#[derive(Clone)]
pub struct Operation {
	cancel: Arc<watch::Sender<bool>>,
}

impl Operation {
	pub fn new() -> Self {
		let (cancel, _) = watch::channel(false);
		Self {
			cancel: Arc::new(cancel),
		}
	}

	/// An operation that cancels itself once `timeout` elapses.
	///
	/// Must be called from within a Tokio runtime.
	pub fn with_timeout(timeout: Duration) -> Self {
		let op = Self::new();
		let deadline = op.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(timeout) => deadline.cancel(),
				_ = deadline.cancelled() => {}
			}
		});
		op
	}

	/// A derived operation: cancelled when `self` is, but cancelling the child
	/// leaves the parent untouched.
	///
	/// Must be called from within a Tokio runtime.
	pub fn child(&self) -> Self {
		let child = Self::new();
		let parent = self.clone();
		let linked = child.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = parent.cancelled() => linked.cancel(),
				_ = linked.cancelled() => {}
			}
		});
		child
	}

	pub fn cancel(&self) {
		self.cancel.send_if_modified(|cancelled| !std::mem::replace(cancelled, true));
	}

	pub fn is_cancelled(&self) -> bool {
		*self.cancel.borrow()
	}

	/// Resolves once the operation is cancelled.
	pub async fn cancelled(&self) {
		let mut rx = self.cancel.subscribe();
		// the sender lives in `self`, so this only returns once cancelled
		let _ = rx.wait_for(|cancelled| *cancelled).await;
	}
}

impl Default for Operation {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for Operation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Operation")
			.field("cancelled", &self.is_cancelled())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;
	use tokio::time::timeout;

	#[tokio::test]
	async fn cancel_is_visible_to_clones() {
		let op = Operation::new();
		let other = op.clone();
		assert!(!other.is_cancelled());

		op.cancel();
		op.cancel();
		assert!(other.is_cancelled());
		timeout(Duration::from_secs(1), other.cancelled()).await.unwrap();
	}

	#[tokio::test]
	async fn child_follows_parent() {
		let parent = Operation::new();
		let child = parent.child();

		parent.cancel();
		timeout(Duration::from_secs(1), child.cancelled()).await.unwrap();
	}

	#[tokio::test]
	async fn child_cancel_does_not_reach_parent() {
		let parent = Operation::new();
		let child = parent.child();

		child.cancel();
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert!(child.is_cancelled());
		assert!(!parent.is_cancelled());
	}

	#[tokio::test]
	async fn timeout_cancels() {
		let op = Operation::with_timeout(Duration::from_millis(50));
		assert!(!op.is_cancelled());
		timeout(Duration::from_secs(2), op.cancelled()).await.unwrap();
	}
}
