use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_SERVER_SOCK: &str = "/tmp/restarter.sock";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("invalid config {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// The supervisor configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control socket path; `None` (or `null`) means [`DEFAULT_SERVER_SOCK`].
    #[serde(default)]
    pub server_sock: Option<PathBuf>,
    /// Receives supervisor audit lines; also tailed by the `log` command.
    #[serde(default)]
    pub global_log_file: Option<PathBuf>,
    /// Touching this file reloads the whole supervisor.
    #[serde(default)]
    pub global_watch_file: Option<PathBuf>,
    /// Base for relative restartable paths and the default spawn cwd.
    #[serde(default)]
    pub global_working_directory: Option<PathBuf>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub email_notification: Option<EmailSettings>,
    #[serde(default)]
    pub restartables: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// `host` or `host:port` (port defaults to 25).
    pub host: String,
    #[serde(default)]
    pub ssl: bool,
    pub from: String,
    /// One address, or several separated by commas.
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    #[serde(default)]
    pub signal: Option<SignalSpec>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub watch_file: Option<PathBuf>,
}

/// Stop signal as written in the document: `"SIGTERM"`, `"term"` or `15`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

impl SignalSpec {
    pub fn parsed(&self) -> anyhow::Result<Signal> {
        match self {
            SignalSpec::Number(n) => Signal::try_from(*n)
                .map_err(|e| anyhow::anyhow!("unsupported signal number {n}: {e}")),
            SignalSpec::Name(s) => parse_signal(s),
        }
    }
}

pub fn parse_signal(s: &str) -> anyhow::Result<Signal> {
    let raw = s.trim().to_uppercase();
    if let Ok(n) = raw.parse::<i32>() {
        return Signal::try_from(n).map_err(|e| anyhow::anyhow!("unsupported signal number {n}: {e}"));
    }
    let name = if raw.starts_with("SIG") { raw } else { format!("SIG{raw}") };
    Signal::from_str(&name).map_err(|_| anyhow::anyhow!("unsupported signal: {s:?}"))
}

impl ProcessSpec {
    pub fn stop_signal(&self) -> anyhow::Result<Option<Signal>> {
        self.signal.as_ref().map(SignalSpec::parsed).transpose()
    }
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        self.server_sock
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_SOCK))
    }

    /// Anchors every relative path of the document (restartable files, the
    /// global log and watch files, the socket) at `global_working_directory`.
    /// No-op when that is unset.
    pub fn resolve_paths(&mut self) {
        let Some(base) = self.global_working_directory.clone() else {
            return;
        };
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for p in [
            self.global_watch_file.as_mut(),
            self.global_log_file.as_mut(),
            self.server_sock.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            anchor(p);
        }
        for spec in &mut self.restartables {
            anchor(&mut spec.pid_file);
            anchor(&mut spec.log_file);
            if let Some(p) = spec.watch_file.as_mut() {
                anchor(p);
            }
            match spec.working_directory.as_mut() {
                Some(p) => anchor(p),
                None => spec.working_directory = Some(base.clone()),
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (idx, spec) in self.restartables.iter().enumerate() {
            if spec.command.split_whitespace().next().is_none() {
                return Err(format!("restartables[{idx}].command must not be empty"));
            }
            if let Err(e) = spec.stop_signal() {
                return Err(format!("restartables[{idx}].signal: {e}"));
            }
        }
        if let Some(email) = &self.email_notification {
            if email.host.trim().is_empty() {
                return Err("email_notification.host must not be empty".to_string());
            }
            if email.to.split(',').all(|s| s.trim().is_empty()) {
                return Err("email_notification.to must name at least one recipient".to_string());
            }
        }
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()),
        Some(ref e) if e == "yml" || e == "yaml"
    )
}

/// Parses a config document; the format follows the extension of `path`.
pub fn parse_config(path: &Path, raw: &str) -> Result<Config, ConfigError> {
    let parsed = if is_yaml(path) {
        serde_yaml::from_str::<Config>(raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<Config>(raw).map_err(|e| e.to_string())
    };
    let mut cfg = parsed.map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;
    cfg.validate().map_err(|reason| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason,
    })?;
    cfg.resolve_paths();
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &raw)
}
