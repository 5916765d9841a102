use crate::sup::config::{self, DEFAULT_SERVER_SOCK};
use crate::sup::rpc::{self, Command, Reply};
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;

const NOT_RUNNING: &str =
    "restarter is probably not running, you need to start it before you can run client commands!";

#[derive(Debug, Parser)]
#[command(name = "restarterctl", version, about = "restarter control client")]
pub struct CtlArgs {
    /// Unix socket path of the restarter daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    /// Read `server_sock` from this restarter config when no socket is given
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<CtlCmd>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CtlCmd {
    /// Show every started command and whether it is alive (default)
    Status,
    /// Stop running commands matching a regex; they stay down
    Stop { pattern: Option<String> },
    /// Start stopped commands matching a regex
    Start { pattern: Option<String> },
    /// Stop everything and shut the daemon down
    Exit,
    /// Tail the restarter log, labelled by the first command matching a regex
    Log { pattern: Option<String> },
    /// Stop everything, re-read the configuration and boot again
    Reload,
}

impl From<CtlCmd> for Command {
    fn from(c: CtlCmd) -> Self {
        match c {
            CtlCmd::Status => Command::Status,
            CtlCmd::Stop { pattern } => Command::Stop { pattern },
            CtlCmd::Start { pattern } => Command::Start { pattern },
            CtlCmd::Exit => Command::Exit,
            CtlCmd::Log { pattern } => Command::Log { pattern },
            CtlCmd::Reload => Command::Reload,
        }
    }
}

fn resolve_sock(args: &CtlArgs) -> anyhow::Result<PathBuf> {
    if let Some(sock) = args.sock.clone() {
        return Ok(sock);
    }
    if let Ok(v) = env::var("RESTARTER_SOCK") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }
    if let Some(path) = &args.config {
        let cfg = config::load_config(path)?;
        return Ok(cfg.socket_path());
    }
    Ok(PathBuf::from(DEFAULT_SERVER_SOCK))
}

/// Runs one command; the return value is the process exit code.
pub async fn run() -> i32 {
    let args = CtlArgs::parse();
    let sock = match resolve_sock(&args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e:#}");
            return 2;
        }
    };
    if !sock.exists() {
        eprintln!("{NOT_RUNNING}");
        return 2;
    }

    let command: Command = args.cmd.unwrap_or(CtlCmd::Status).into();
    match rpc::client_call(&sock, &command).await {
        Ok(Reply::Success(text)) => {
            println!("{}", text.trim_end());
            0
        }
        Ok(Reply::Error(text)) => {
            eprintln!("{text}");
            1
        }
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    }
}
