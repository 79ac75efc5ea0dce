use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
	#[serde(default)]
	pub defaults: Defaults,
	#[serde(default, rename = "process")]
	pub processes: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
	#[serde(default = "default_grace")]
	pub grace: String,
	pub log_dir: Option<PathBuf>,
	#[serde(default = "default_max_log_size")]
	pub max_log_size: u64,
}

impl Default for Defaults {
	fn default() -> Self {
		Self {
			grace: default_grace(),
			log_dir: None,
			max_log_size: default_max_log_size(),
		}
	}
}

fn default_grace() -> String {
	"250ms".to_string()
}
fn default_max_log_size() -> u64 {
	10 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
	pub name: String,
	pub command: String,
	pub dir: Option<PathBuf>,
	#[serde(default)]
	pub env: Vec<String>,
	#[serde(default)]
	pub restart: bool,
	#[serde(default)]
	pub raw: bool,
	pub timeout: Option<String>,
	pub grace: Option<String>,
	pub user: Option<User>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct User {
	pub uid: u32,
	pub gid: u32,
}

pub fn load(path: &Path) -> Result<Config, String> {
	let text = std::fs::read_to_string(path)
		.map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
}

pub fn parse(text: &str) -> Result<Config, String> {
	let config: Config = toml::from_str(text).map_err(|e| e.to_string())?;
	parse_duration(&config.defaults.grace)?;
	for p in &config.processes {
		if p.name.trim().is_empty() {
			return Err("process with empty name".to_string());
		}
		for d in [&p.timeout, &p.grace].into_iter().flatten() {
			parse_duration(d).map_err(|e| format!("{}: {}", p.name, e))?;
		}
	}
	Ok(config)
}

/// `"250ms"`, `"3s"`, `"5m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
	let s = s.trim();
	if s.is_empty() {
		return Err("empty duration string".to_string());
	}

	let idx = s
		.chars()
		.position(|c| !c.is_ascii_digit())
		.ok_or_else(|| format!("duration '{}' is missing a unit", s))?;

	let (num_part, unit_part) = s.split_at(idx);
	let value: u64 = num_part
		.parse()
		.map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;

	let scaled = |factor: u64| {
		value
			.checked_mul(factor)
			.map(Duration::from_secs)
			.ok_or_else(|| format!("duration '{}' is too large", s))
	};

	match unit_part.trim().to_lowercase().as_str() {
		"ms" => Ok(Duration::from_millis(value)),
		"s" => Ok(Duration::from_secs(value)),
		"m" => scaled(60),
		"h" => scaled(60 * 60),
		unit => Err(format!("unsupported duration unit '{}'; expected ms, s, m, or h", unit)),
	}
}

/// `"1000:1000"` into `(uid, gid)`.
pub fn parse_user(s: &str) -> Result<(u32, u32), String> {
	let (uid, gid) = s
		.split_once(':')
		.ok_or_else(|| format!("expected uid:gid, got '{}'", s))?;
	let uid = uid.parse().map_err(|_| format!("invalid uid '{}'", uid))?;
	let gid = gid.parse().map_err(|_| format!("invalid gid '{}'", gid))?;
	Ok((uid, gid))
}
