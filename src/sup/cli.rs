use crate::sup::{build_info, daemon};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "restarter", version, about = "restarter process supervisor")]
pub struct Args {
    /// Path to the configuration file (JSON, or YAML by .yml/.yaml extension)
    #[arg(short = 'c', long = "config", default_value = "restarter.json")]
    pub config: PathBuf,
}

/// Operator diagnostics on stderr; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();
    tracing::info!("{}", build_info::banner());
    daemon::run_daemon_async(&args.config).await
}
