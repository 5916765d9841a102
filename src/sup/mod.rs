pub mod audit;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod controller;
pub mod ctl_cli;
pub mod daemon;
pub mod health;
pub mod notifier;
pub mod record;
pub mod rpc;
pub mod smtp;
pub mod watch;
