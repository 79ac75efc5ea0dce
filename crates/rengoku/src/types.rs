use tokio::sync::watch;

/// Lifecycle of a single run of a [`Process`](crate::Process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
	/// Constructed, or the last `execute` failed before anything was spawned.
	Idle,
	Running,
	/// Termination requested; waiting for the child to go away.
	Stopping,
	/// Reaped; exit status and error are final for this run.
	Exited,
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running | ProcessState::Stopping)
	}
}

/// The stop request for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopState {
	NotRequested,
	/// `stop` was called and termination is in progress.
	Requested,
	/// Termination finished; a further `stop` is rejected until the next run.
	Consumed,
}

/// Fires once the run it was taken for has been fully reaped.
///
/// Any number of clones may wait on the same run.
#[derive(Debug, Clone)]
pub struct Exited {
	exits: watch::Receiver<u64>,
	target: u64,
}

impl Exited {
	pub(crate) fn new(exits: watch::Receiver<u64>, target: u64) -> Self {
		Self { exits, target }
	}

	pub async fn wait(&mut self) {
		let target = self.target;
		// a dropped sender means nothing is left to report an exit
		let _ = self.exits.wait_for(|n| *n >= target).await;
	}

	pub fn has_fired(&self) -> bool {
		*self.exits.borrow() >= self.target
	}
}
