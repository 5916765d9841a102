//! Start / stop / restart primitives for a single [`ProcessRecord`].
//!
//! None of these return errors: spawn and signal failures are written to the
//! audit log and surface to callers only through the next health sweep.

use crate::sup::audit::{append_bytes, AuditLog};
use crate::sup::record::{read_pid_file, write_pid_file, ProcessRecord};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Signalled(u32),
    NotFound(u32),
    /// No readable pid in the pid file.
    NoPid,
    /// The record has no stop signal configured.
    NoSignal,
}

pub async fn start(record: &mut ProcessRecord, audit: &AuditLog) -> Option<u32> {
    let mut cmd = {
        let Some((program, args)) = record.argv() else {
            audit.event("spawn", format!("spawn failed command={:?} err=empty command", record.command));
            return None;
        };
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &record.working_directory {
            cmd.current_dir(cwd);
        }
        cmd
    };

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            audit.event(
                "spawn",
                format!(
                    "spawn failed command={} cwd={} kind={:?} err={e}",
                    record.command,
                    record
                        .working_directory
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| ".".to_string()),
                    e.kind()
                ),
            );
            return None;
        }
    };
    let Some(pid) = child.id() else {
        audit.event("spawn", format!("spawn failed command={} err=child exited before pid was read", record.command));
        return None;
    };

    if let Some(out) = child.stdout.take() {
        spawn_output_pump(out, record.log_file.clone());
    }
    if let Some(err) = child.stderr.take() {
        spawn_output_pump(err, record.log_file.clone());
    }

    if let Err(e) = write_pid_file(&record.pid_file, pid).await {
        audit.event("spawn", format!("pid file write failed pid={pid} err={e:#}"));
    }
    record.pid = Some(pid);
    audit.event("spawn", format!("spawn pid={pid} command={}", record.command));

    // The waiter reaps the child so a dead process never lingers as a
    // zombie that would still answer the liveness probe.
    let waiter_audit = audit.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => waiter_audit.event("exit", format!("exited pid={pid} status={status}")),
            Err(e) => waiter_audit.event("exit", format!("wait failed pid={pid} err={e}")),
        }
    });
    Some(pid)
}

fn spawn_output_pump<R>(pipe: R, log_file: PathBuf)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut pipe = pipe;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(log = %log_file.display(), "output pipe read failed: {e}");
                    break;
                }
            };
            // Best-effort: a failed append drops this chunk only.
            if let Err(e) = append_bytes(&log_file, &buf[..n]).await {
                tracing::warn!(log = %log_file.display(), "output append failed: {e:#}");
            }
        }
    });
}

/// Signals the pid recorded on disk, not the in-memory one, so a record
/// rebuilt by a reload can still stop what its predecessor spawned.
pub async fn stop(record: &ProcessRecord, audit: &AuditLog) -> StopOutcome {
    let Some(pid) = read_pid_file(&record.pid_file).await else {
        return StopOutcome::NoPid;
    };
    let Some(signal) = record.signal else {
        return StopOutcome::NoSignal;
    };
    let Ok(raw) = i32::try_from(pid) else {
        audit.event("stop", format!("could not find pid to kill pid={pid}"));
        return StopOutcome::NotFound(pid);
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => {
            audit.event("stop", format!("killed pid={pid} signal={signal}"));
            StopOutcome::Signalled(pid)
        }
        Err(e) => {
            audit.event("stop", format!("could not find pid to kill pid={pid} err={e}"));
            StopOutcome::NotFound(pid)
        }
    }
}

/// Stop, then start once the signal has been issued. No backoff.
pub async fn restart(record: &mut ProcessRecord, audit: &AuditLog) -> Option<u32> {
    stop(record, audit).await;
    start(record, audit).await
}
