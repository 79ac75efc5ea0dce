use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::CommandLine;
use crate::error::Error;
use crate::lock;
use crate::operation::Operation;
use crate::output::{Sink, Stdout};
use crate::stream::{Multiplexer, Stream};
use crate::types::{Exited, ProcessState, StopState};

/// Grace interval between SIGTERM and SIGKILL unless overridden with
/// [`Process::set_grace_period`].
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// How long the exit watcher waits, after reaping, for stdout/stderr to reach
/// end-of-file. A grandchild that inherited the pipes can hold them open
/// indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Source forwarded into the child's standard input.
pub type Input = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to one external command and the lifecycle of its runs.
///
/// Cloning is cheap and every clone refers to the same process. A handle runs
/// at most one child at a time; `execute` again only after [`Process::exited`]
/// has fired for the previous run.
#[derive(Clone)]
pub struct Process {
	inner: Arc<Inner>,
}

struct Inner {
	name: String,
	command: CommandLine,
	settings: Mutex<Settings>,
	runtime: Mutex<Runtime>,
	stop: watch::Sender<StopState>,
	exits: watch::Sender<u64>,
}

struct Settings {
	dir: Option<PathBuf>,
	env: Vec<String>,
	user: Option<(u32, u32)>,
	sinks: Vec<Arc<dyn Sink>>,
	input: Option<Input>,
	raw_output: bool,
	interactive: bool,
	grace_period: Duration,
}

/// Written by the exit watcher and by `launch`; everything else reads.
struct Runtime {
	state: ProcessState,
	pid: Option<u32>,
	status: Option<ExitStatus>,
	error: Option<Error>,
	runs: u64,
	supervised: bool,
}

impl Process {
	/// Resolve `command` and build an idle handle.
	///
	/// With no sinks, output goes to the parent's standard output.
	pub fn new(name: impl Into<String>, command: &str, sinks: Vec<Arc<dyn Sink>>) -> Result<Self, Error> {
		let command = CommandLine::parse(command)?;
		let sinks = if sinks.is_empty() {
			vec![Arc::new(Stdout) as Arc<dyn Sink>]
		} else {
			sinks
		};
		let (stop, _) = watch::channel(StopState::NotRequested);
		let (exits, _) = watch::channel(0);

		Ok(Self {
			inner: Arc::new(Inner {
				name: name.into(),
				command,
				settings: Mutex::new(Settings {
					dir: None,
					env: Vec::new(),
					user: None,
					sinks,
					input: None,
					raw_output: false,
					interactive: false,
					grace_period: DEFAULT_GRACE_PERIOD,
				}),
				runtime: Mutex::new(Runtime {
					state: ProcessState::Idle,
					pid: None,
					status: None,
					error: None,
					runs: 0,
					supervised: false,
				}),
				stop,
				exits,
			}),
		})
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn binary(&self) -> &Path {
		&self.inner.command.binary
	}

	pub fn args(&self) -> &[String] {
		&self.inner.command.args
	}

	// --- configuration, ignored while a run is in progress ---

	pub fn set_dir(&self, dir: impl Into<PathBuf>) -> &Self {
		let dir = dir.into();
		self.configure("dir", |s| s.dir = Some(dir))
	}

	/// `KEY=VALUE` entries replacing the inherited environment. An empty list
	/// means inherit.
	pub fn set_env<I, S>(&self, env: I) -> &Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let env = env.into_iter().map(Into::into).collect();
		self.configure("env", |s| s.env = env)
	}

	pub fn set_user(&self, uid: u32, gid: u32) -> &Self {
		self.configure("user", |s| s.user = Some((uid, gid)))
	}

	pub fn add_sink(&self, sink: Arc<dyn Sink>) -> &Self {
		self.configure("sink", |s| s.sinks.push(sink))
	}

	/// Forwarded into the child's stdin. The source is consumed by the next
	/// run; later runs get no input unless it is set again.
	pub fn set_input(&self, input: Input) -> &Self {
		self.configure("input", |s| s.input = Some(input))
	}

	pub fn set_raw_output(&self, raw: bool) -> &Self {
		self.configure("raw output", |s| s.raw_output = raw)
	}

	/// Attach the child directly to the parent's stdin instead of forwarding
	/// an input source.
	pub fn set_interactive(&self, interactive: bool) -> &Self {
		self.configure("interactive", |s| s.interactive = interactive)
	}

	pub fn set_grace_period(&self, grace: Duration) -> &Self {
		self.configure("grace period", |s| s.grace_period = grace)
	}

	fn configure(&self, what: &str, apply: impl FnOnce(&mut Settings)) -> &Self {
		if self.state().is_running() {
			warn!(process = %self, setting = what, "ignoring configuration while running");
			return self;
		}
		apply(&mut lock(&self.inner.settings));
		self
	}

	// --- observation ---

	/// OS process id of the current run; `None` when no child is attached.
	pub fn pid(&self) -> Option<u32> {
		lock(&self.inner.runtime).pid
	}

	pub fn state(&self) -> ProcessState {
		lock(&self.inner.runtime).state
	}

	/// Last error: a launch failure, a wait failure, or an unsuccessful exit.
	/// `None` after a clean exit.
	pub fn error(&self) -> Option<Error> {
		lock(&self.inner.runtime).error.clone()
	}

	pub fn exit_status(&self) -> Option<ExitStatus> {
		lock(&self.inner.runtime).status
	}

	/// Number of successful launches, across restarts.
	pub fn runs(&self) -> u64 {
		lock(&self.inner.runtime).runs
	}

	/// Notification for the current (or most recent) run. Taken before the
	/// first run, it fires when that run exits.
	pub fn exited(&self) -> Exited {
		let target = lock(&self.inner.runtime).runs.max(1);
		Exited::new(self.inner.exits.subscribe(), target)
	}

	pub fn grace_period(&self) -> Duration {
		lock(&self.inner.settings).grace_period
	}

	// --- lifecycle ---

	/// Start the command and return once it is running.
	///
	/// Output forwarding, the exit watcher, and a listener that kills the
	/// child as soon as `op` is cancelled all run in the background. On error
	/// nothing was spawned and the handle stays reusable.
	pub async fn execute(&self, op: &Operation) -> Result<(), Error> {
		self.launch(op, true).map(|_| ())
	}

	/// Returns `Ok(false)` when a pending stop request vetoed a restart.
	pub(crate) fn launch(&self, op: &Operation, fresh: bool) -> Result<bool, Error> {
		let mut runtime = lock(&self.inner.runtime);
		if runtime.state.is_running() {
			return Err(Error::AlreadyRunning);
		}
		if !fresh && *self.inner.stop.borrow() != StopState::NotRequested {
			return Ok(false);
		}

		let mut settings = lock(&self.inner.settings);
		let forward_input = !settings.interactive && settings.input.is_some();
		let mut cmd = self.build_command(&settings, forward_input);

		let mut child = match cmd.spawn() {
			Ok(child) => child,
			Err(e) => {
				let err = Error::spawn(&self.inner.command.binary, e);
				runtime.error = Some(err.clone());
				return Err(err);
			}
		};

		if fresh {
			self.inner.stop.send_replace(StopState::NotRequested);
		}
		runtime.state = ProcessState::Running;
		runtime.pid = child.id();
		runtime.status = None;
		runtime.error = None;
		runtime.runs += 1;

		let label = format!("{}(pid={})", self.inner.name, child.id().unwrap_or_default());
		let sinks: Arc<[Arc<dyn Sink>]> = settings.sinks.clone().into();
		let mux = if settings.raw_output {
			Multiplexer::raw(sinks)
		} else {
			Multiplexer::annotated(&self.inner.name, sinks)
		};

		let mut drains = Vec::with_capacity(2);
		if let Some(stdout) = child.stdout.take() {
			let (mux, label) = (mux.clone(), label.clone());
			drains.push(tokio::spawn(async move {
				mux.forward(stdout, Stream::Stdout, &label).await;
			}));
		}
		if let Some(stderr) = child.stderr.take() {
			let (mux, label) = (mux.clone(), label.clone());
			drains.push(tokio::spawn(async move {
				mux.forward(stderr, Stream::Stderr, &label).await;
			}));
		}
		if forward_input {
			if let (Some(input), Some(stdin)) = (settings.input.take(), child.stdin.take()) {
				tokio::spawn(forward_input_to(input, stdin, label.clone()));
			}
		}
		drop(settings);
		drop(runtime);

		let run = op.child();
		tokio::spawn(self.clone().watch_exit(child, drains, run.clone()));
		tokio::spawn(self.clone().listen(op.clone(), run));

		info!(process = %label, binary = %self.inner.command.binary.display(), "started");
		Ok(true)
	}

	fn build_command(&self, settings: &Settings, forward_input: bool) -> Command {
		let mut cmd = Command::new(&self.inner.command.binary);
		cmd.args(&self.inner.command.args)
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		cmd.stdin(if settings.interactive {
			Stdio::inherit()
		} else if forward_input {
			Stdio::piped()
		} else {
			Stdio::null()
		});

		if let Some(dir) = &settings.dir {
			cmd.current_dir(dir);
		}
		if !settings.env.is_empty() {
			cmd.env_clear();
			for entry in &settings.env {
				let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
				cmd.env(key, value);
			}
		}
		if let Some((uid, gid)) = settings.user {
			cmd.uid(uid).gid(gid);
		}
		cmd
	}

	/// Sole writer of the run's final state. Reaps the child, lets the output
	/// drain, then releases the run's operation and fires `exited`.
	async fn watch_exit(self, mut child: Child, drains: Vec<JoinHandle<()>>, run: Operation) {
		let result = child.wait().await;
		{
			let mut runtime = lock(&self.inner.runtime);
			runtime.pid = None;
			match result {
				Ok(status) => {
					runtime.status = Some(status);
					runtime.error = (!status.success()).then_some(Error::Exited(status));
				}
				Err(e) => runtime.error = Some(Error::Wait(Arc::new(e))),
			}
		}

		let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
			for drain in drains {
				let _ = drain.await;
			}
		})
		.await;
		if drained.is_err() {
			debug!(process = %self, "output still open after exit; detaching readers");
		}

		let status = {
			let mut runtime = lock(&self.inner.runtime);
			runtime.state = ProcessState::Exited;
			runtime.status
		};
		debug!(process = %self, ?status, "exited");

		run.cancel();
		self.inner.exits.send_modify(|n| *n += 1);
	}

	/// Kills the child the moment the caller's operation is cancelled; quits
	/// once the run is over.
	async fn listen(self, op: Operation, run: Operation) {
		tokio::select! {
			biased;
			_ = op.cancelled() => {
				self.mark_stopping();
				if let Err(e) = self.kill() {
					warn!(process = %self, error = %e, "kill after cancellation failed");
				}
			}
			_ = run.cancelled() => {}
		}
	}

	fn mark_stopping(&self) {
		let mut runtime = lock(&self.inner.runtime);
		if runtime.state == ProcessState::Running {
			runtime.state = ProcessState::Stopping;
		}
	}

	/// Request graceful termination of the current run: SIGTERM, then SIGKILL
	/// if the child outlives the grace period.
	///
	/// Under [`Process::execute_and_restart`] this also ends the restart loop.
	/// Calling it twice for the same run returns
	/// [`Error::StopAlreadyRequested`].
	pub async fn stop(&self) -> Result<(), Error> {
		{
			let runtime = lock(&self.inner.runtime);
			if !runtime.state.is_running() && !runtime.supervised {
				return Err(Error::NotRunning);
			}
		}

		let mut requested = false;
		self.inner.stop.send_if_modified(|state| {
			if *state == StopState::NotRequested {
				*state = StopState::Requested;
				requested = true;
			}
			requested
		});
		if !requested {
			return Err(Error::StopAlreadyRequested);
		}

		self.mark_stopping();
		let result = self.term().await;
		self.inner.stop.send_replace(StopState::Consumed);
		result
	}

	/// SIGTERM, wait up to the grace period, then SIGKILL if the same child is
	/// still attached. Only the timeout escalates; a failed SIGTERM is
	/// returned as is.
	pub async fn term(&self) -> Result<(), Error> {
		let Some(pid) = self.pid() else {
			return Ok(());
		};
		let mut exited = self.exited();
		self.signal(Signal::SIGTERM)?;

		let grace = self.grace_period();
		if tokio::time::timeout(grace, exited.wait()).await.is_ok() {
			return Ok(());
		}
		if self.pid() == Some(pid) {
			debug!(process = %self, ?grace, "still running after grace period; killing");
			return self.kill();
		}
		Ok(())
	}

	/// SIGKILL the attached child. A no-op without one.
	pub fn kill(&self) -> Result<(), Error> {
		self.signal(Signal::SIGKILL)
	}

	/// Deliver `sig` to the attached child. A no-op without one, or if the
	/// child is already gone.
	pub fn signal(&self, sig: Signal) -> Result<(), Error> {
		let runtime = lock(&self.inner.runtime);
		let Some(pid) = runtime.pid else {
			return Ok(());
		};
		match signal::kill(Pid::from_raw(pid as i32), sig) {
			Ok(()) | Err(Errno::ESRCH) => Ok(()),
			Err(errno) => Err(Error::Signal { signal: sig, errno }),
		}
	}

	pub(crate) fn set_supervised(&self, supervised: bool) {
		lock(&self.inner.runtime).supervised = supervised;
	}

	pub(crate) fn record_error(&self, err: Error) {
		lock(&self.inner.runtime).error = Some(err);
	}

	pub(crate) fn stop_watch(&self) -> watch::Receiver<StopState> {
		self.inner.stop.subscribe()
	}
}

async fn forward_input_to(mut input: Input, mut stdin: ChildStdin, label: String) {
	match tokio::io::copy(&mut input, &mut stdin).await {
		Ok(n) => debug!(process = %label, bytes = n, "input forwarded"),
		Err(e) => debug!(process = %label, error = %e, "input forwarding stopped"),
	}
	// dropping stdin closes the child's end
}

impl fmt::Display for Process {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.pid() {
			Some(pid) => write!(f, "{}(pid={})", self.inner.name, pid),
			None => write!(f, "{}", self.inner.name),
		}
	}
}

impl fmt::Debug for Process {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Process")
			.field("name", &self.inner.name)
			.field("binary", &self.inner.command.binary)
			.field("args", &self.inner.command.args)
			.field("state", &self.state())
			.field("pid", &self.pid())
			.finish()
	}
}
