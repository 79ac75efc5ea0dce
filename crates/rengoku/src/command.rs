use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// A command string split into its program and arguments, with the program
/// resolved to an executable path once, at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
	pub program: String,
	pub binary: PathBuf,
	pub args: Vec<String>,
}

impl CommandLine {
	/// Split `command` on whitespace and resolve its first token against `PATH`.
	///
	/// No shell quoting is interpreted: `sh -c "a b"` yields the arguments
	/// `-c`, `"a` and `b"`.
	pub fn parse(command: &str) -> Result<Self, Error> {
		Self::parse_in(command, std::env::var_os("PATH"))
	}

	pub(crate) fn parse_in(command: &str, search_path: Option<OsString>) -> Result<Self, Error> {
		let mut fields = command.split_whitespace();
		let program = fields
			.next()
			.ok_or_else(|| Error::InvalidCommand(command.to_string()))?;
		let binary = look_path_in(program, search_path)?;

		Ok(Self {
			program: program.to_string(),
			binary,
			args: fields.map(str::to_string).collect(),
		})
	}
}

/// Resolve `program` the way a shell would: names containing a slash are
/// checked directly, bare names are searched for in each `PATH` entry.
pub fn look_path(program: &str) -> Result<PathBuf, Error> {
	look_path_in(program, std::env::var_os("PATH"))
}

fn look_path_in(program: &str, search_path: Option<OsString>) -> Result<PathBuf, Error> {
	if program.contains('/') {
		let path = PathBuf::from(program);
		return if is_executable(&path) {
			Ok(path)
		} else {
			Err(Error::ExecutableNotFound(program.to_string()))
		};
	}

	search_path
		.iter()
		.flat_map(std::env::split_paths)
		// an empty entry is not treated as the current directory
		.filter(|dir| !dir.as_os_str().is_empty())
		.map(|dir| dir.join(program))
		.find(|candidate| is_executable(candidate))
		.ok_or_else(|| Error::ExecutableNotFound(program.to_string()))
}

fn is_executable(path: &Path) -> bool {
	match std::fs::metadata(path) {
		Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static COUNTER: AtomicU32 = AtomicU32::new(0);

	fn temp_bin_dir() -> PathBuf {
		let n = COUNTER.fetch_add(1, Ordering::SeqCst);
		let dir = std::env::temp_dir().join(format!("rengoku-cmd-{}-{}", std::process::id(), n));
		let _ = std::fs::create_dir_all(&dir);
		dir
	}

	fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
		let path = dir.join(name);
		std::fs::write(&path, "#!/bin/sh\n").unwrap();
		std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
		path
	}

	#[test]
	fn splits_program_and_args() {
		let dir = temp_bin_dir();
		let bin = touch(&dir, "tool", 0o755);

		let cmd = CommandLine::parse_in("  tool  --flag   value ", Some(dir.clone().into())).unwrap();
		assert_eq!(cmd.program, "tool");
		assert_eq!(cmd.binary, bin);
		assert_eq!(cmd.args, vec!["--flag", "value"]);

		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn empty_command_is_invalid() {
		for input in ["", "   ", "\t\n"] {
			let err = CommandLine::parse_in(input, None).unwrap_err();
			assert!(matches!(err, Error::InvalidCommand(_)), "{:?}", input);
		}
	}

	#[test]
	fn missing_program_is_not_found() {
		let dir = temp_bin_dir();
		let err = CommandLine::parse_in("nope", Some(dir.clone().into())).unwrap_err();
		assert!(matches!(err, Error::ExecutableNotFound(ref p) if p == "nope"));
		let _ = std::fs::remove_dir_all(&dir);
	}

	#[test]
	fn skips_non_executable_files() {
		let first = temp_bin_dir();
		let second = temp_bin_dir();
		touch(&first, "tool", 0o644);
		let bin = touch(&second, "tool", 0o755);

		let search = std::env::join_paths([&first, &second]).unwrap();
		assert_eq!(look_path_in("tool", Some(search)).unwrap(), bin);

		let _ = std::fs::remove_dir_all(&first);
		let _ = std::fs::remove_dir_all(&second);
	}

	#[test]
	fn explicit_paths_bypass_search() {
		let dir = temp_bin_dir();
		let bin = touch(&dir, "direct", 0o755);
		let program = bin.to_str().unwrap();

		assert_eq!(look_path_in(program, None).unwrap(), bin);
		assert!(look_path_in(&format!("{}/missing", dir.display()), None).is_err());

		let _ = std::fs::remove_dir_all(&dir);
	}
}
