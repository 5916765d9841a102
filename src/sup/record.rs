use crate::sup::config::ProcessSpec;
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};

/// One managed command and its runtime state.
///
/// `pid` is set when a child is spawned and never cleared: liveness is
/// decided by the health probe, not by this field.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub command: String,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub signal: Option<Signal>,
    pub working_directory: Option<PathBuf>,
    pub watch_file: Option<PathBuf>,
    pub pid: Option<u32>,
    /// Deliberately stopped; the health monitor leaves it alone.
    pub ignore: bool,
}

impl ProcessRecord {
    pub fn from_spec(spec: &ProcessSpec) -> anyhow::Result<Self> {
        Ok(Self {
            command: spec.command.clone(),
            pid_file: spec.pid_file.clone(),
            log_file: spec.log_file.clone(),
            signal: spec.stop_signal()?,
            working_directory: spec.working_directory.clone(),
            watch_file: spec.watch_file.clone(),
            pid: None,
            ignore: false,
        })
    }

    /// Program and arguments, split on whitespace.
    pub fn argv(&self) -> Option<(&str, Vec<&str>)> {
        split_command(&self.command)
    }
}

pub fn split_command(command: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = command.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// First run of decimal digits in a pid file, if any and non-zero.
pub fn parse_pid(content: &str) -> Option<u32> {
    let start = content.find(|c: char| c.is_ascii_digit())?;
    let digits: String = content[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().filter(|pid| *pid != 0)
}

pub async fn read_pid_file(path: &Path) -> Option<u32> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    parse_pid(&content)
}

pub async fn write_pid_file(path: &Path, pid: u32) -> anyhow::Result<()> {
    use anyhow::Context as _;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
    }
    tokio::fs::write(path, pid.to_string())
        .await
        .with_context(|| format!("write pid file {}", path.display()))
}
