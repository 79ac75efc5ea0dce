mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use rengoku::{LogFile, Operation, Process, Sink, Stdout};

#[derive(Debug, Parser)]
#[command(name = "rengoku", version, about = "Run and supervise external commands")]
struct Cli {
	/// Logging level; falls back to RENGOKU_LOG, then info
	#[arg(long, value_enum, global = true)]
	log_level: Option<LogLevel>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Run one command, streaming its output
	Run(RunArgs),
	/// Supervise every process declared in a config file
	Up {
		#[arg(short, long, default_value = "rengoku.toml")]
		config: PathBuf,
	},
}

#[derive(Debug, clap::Args)]
struct RunArgs {
	/// Label used in output prefixes; defaults to the program name
	#[arg(short, long)]
	name: Option<String>,
	/// Restart the command every time it exits
	#[arg(short, long)]
	restart: bool,
	/// Kill the command (and stop restarting) after this long, e.g. 30s
	#[arg(short, long)]
	timeout: Option<String>,
	/// Grace period between SIGTERM and SIGKILL
	#[arg(long, default_value = "250ms")]
	grace: String,
	/// Do not prefix output lines with [name]
	#[arg(long)]
	raw: bool,
	/// Attach the command to this terminal's stdin
	#[arg(short, long)]
	interactive: bool,
	/// Working directory
	#[arg(short = 'C', long)]
	dir: Option<PathBuf>,
	/// KEY=VALUE; replaces the inherited environment when given
	#[arg(short, long = "env")]
	env: Vec<String>,
	/// Run as uid:gid
	#[arg(long)]
	user: Option<String>,
	/// Also append output to a rotating log file in this directory
	#[arg(long)]
	log_dir: Option<PathBuf>,
	#[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
	command: Vec<String>,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum LogLevel {
	Error,
	Warn,
	Info,
	Debug,
	Trace,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	init_logging(cli.log_level);

	let result = match cli.command {
		Commands::Run(args) => cmd_run(args).await,
		Commands::Up { config } => cmd_up(&config).await,
	};

	match result {
		Ok(code) => std::process::exit(code),
		Err(e) => {
			eprintln!("{} {}", "error:".red(), e);
			std::process::exit(1);
		}
	}
}

fn init_logging(cli_level: Option<LogLevel>) {
	let level = match cli_level {
		Some(LogLevel::Error) => tracing::Level::ERROR,
		Some(LogLevel::Warn) => tracing::Level::WARN,
		Some(LogLevel::Info) => tracing::Level::INFO,
		Some(LogLevel::Debug) => tracing::Level::DEBUG,
		Some(LogLevel::Trace) => tracing::Level::TRACE,
		None => std::env::var("RENGOKU_LOG")
			.ok()
			.and_then(|s| s.trim().parse().ok())
			.unwrap_or(tracing::Level::INFO),
	};

	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_writer(std::io::stderr)
		.init();
}

async fn cmd_run(args: RunArgs) -> Result<i32, String> {
	let command = args.command.join(" ");
	let name = args
		.name
		.clone()
		.or_else(|| args.command.first().map(|p| program_name(p)))
		.unwrap_or_else(|| "process".to_string());

	let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(Stdout)];
	if let Some(dir) = &args.log_dir {
		sinks.push(open_log(dir, &name, 10 * 1024 * 1024)?);
	}

	let process = Process::new(&name, &command, sinks).map_err(|e| e.to_string())?;
	process
		.set_env(args.env.clone())
		.set_raw_output(args.raw)
		.set_interactive(args.interactive)
		.set_grace_period(config::parse_duration(&args.grace)?);
	if let Some(dir) = &args.dir {
		process.set_dir(dir);
	}
	if let Some(user) = &args.user {
		let (uid, gid) = config::parse_user(user)?;
		process.set_user(uid, gid);
	}

	let op = match &args.timeout {
		Some(t) => Operation::with_timeout(config::parse_duration(t)?),
		None => Operation::new(),
	};

	if args.restart {
		let supervised = process.clone();
		let loop_op = op.clone();
		let mut handle = tokio::spawn(async move { supervised.execute_and_restart(&loop_op).await });
		tokio::select! {
			_ = &mut handle => {}
			_ = tokio::signal::ctrl_c() => {
				eprintln!("{} {}", "stopping".yellow(), process);
				let _ = process.stop().await;
				let _ = handle.await;
			}
		}
		if let Some(e) = process.error() {
			if process.runs() == 0 {
				return Err(e.to_string());
			}
		}
		process.exited().wait().await;
		return Ok(0);
	}

	process.execute(&op).await.map_err(|e| e.to_string())?;
	let mut exited = process.exited();
	tokio::select! {
		_ = exited.wait() => {}
		_ = tokio::signal::ctrl_c() => {
			eprintln!("{} {}", "stopping".yellow(), process);
			if let Err(e) = process.stop().await {
				eprintln!("{} {}", "error:".red(), e);
			}
			exited.wait().await;
		}
	}

	Ok(report_exit(&process))
}

async fn cmd_up(path: &Path) -> Result<i32, String> {
	let cfg = config::load(path)?;
	if cfg.processes.is_empty() {
		return Err(format!("{}: no processes defined", path.display()));
	}
	let default_grace = config::parse_duration(&cfg.defaults.grace)?;

	let root = Operation::new();
	let mut processes = Vec::new();
	let mut tasks = Vec::new();

	for def in &cfg.processes {
		let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(Stdout)];
		if let Some(dir) = &cfg.defaults.log_dir {
			sinks.push(open_log(dir, &def.name, cfg.defaults.max_log_size)?);
		}

		let process = Process::new(&def.name, &def.command, sinks)
			.map_err(|e| format!("{}: {}", def.name, e))?;
		let grace = match &def.grace {
			Some(g) => config::parse_duration(g)?,
			None => default_grace,
		};
		process
			.set_env(def.env.clone())
			.set_raw_output(def.raw)
			.set_grace_period(grace);
		if let Some(dir) = &def.dir {
			process.set_dir(dir);
		}
		if let Some(user) = def.user {
			process.set_user(user.uid, user.gid);
		}

		let op = match &def.timeout {
			Some(t) => {
				let op = root.child();
				let timeout = config::parse_duration(t)?;
				let deadline = op.clone();
				tokio::spawn(async move {
					tokio::time::sleep(timeout).await;
					deadline.cancel();
				});
				op
			}
			None => root.clone(),
		};

		let supervised = process.clone();
		let restart = def.restart;
		tasks.push(tokio::spawn(async move {
			if restart {
				supervised.execute_and_restart(&op).await;
			} else if let Err(e) = supervised.execute(&op).await {
				eprintln!("{} {}: {}", "failed".red(), supervised.name(), e);
			}
			if supervised.runs() > 0 {
				supervised.exited().wait().await;
			}
		}));
		processes.push(process);
	}

	let all_done = async {
		for task in tasks.iter_mut() {
			let _ = task.await;
		}
	};
	tokio::select! {
		_ = all_done => {}
		_ = tokio::signal::ctrl_c() => {
			eprintln!("{}", "stopping all processes".yellow());
			for process in &processes {
				if let Err(e) = process.stop().await {
					tracing::debug!(process = %process, error = %e, "stop");
				}
			}
			// force-kill whatever is still attached
			root.cancel();
			for process in processes.iter().filter(|p| p.runs() > 0) {
				let _ = tokio::time::timeout(Duration::from_secs(2), process.exited().wait()).await;
			}
		}
	}

	let mut code = 0;
	for process in &processes {
		if report_exit(process) != 0 {
			code = 1;
		}
	}
	Ok(code)
}

fn open_log(dir: &Path, name: &str, max_size: u64) -> Result<Arc<dyn Sink>, String> {
	let log = LogFile::open(dir, name, max_size)
		.map_err(|e| format!("failed to open log in {}: {}", dir.display(), e))?;
	Ok(Arc::new(log))
}

fn program_name(program: &str) -> String {
	Path::new(program)
		.file_name()
		.map(|n| n.to_string_lossy().to_string())
		.unwrap_or_else(|| program.to_string())
}

/// Print how the last run ended; returns the exit code to propagate.
fn report_exit(process: &Process) -> i32 {
	match (process.exit_status(), process.error()) {
		(Some(status), None) if status.success() => {
			eprintln!("{} {}", "exited".green(), process.name());
			0
		}
		(_, Some(e)) => {
			eprintln!("{} {}: {}", "failed".red(), process.name(), e);
			e.exit_code().unwrap_or(1)
		}
		(_, None) => {
			eprintln!("{} {}", "not started".dimmed(), process.name());
			0
		}
	}
}
