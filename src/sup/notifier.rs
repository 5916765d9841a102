use crate::sup::audit::AuditLog;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes of log included in notifications and `log` replies.
pub const TAIL_BYTES: u64 = 1000;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Delivers one message; `Ok` once the transport accepted it.
pub trait MailTransport: Send + Sync {
    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> SendFuture<'a>;
}

/// Last `max` bytes of `path`, lossily decoded.
pub async fn tail_file(path: &Path, max: u64) -> anyhow::Result<String> {
    let mut f = tokio::fs::File::open(path).await?;
    let len = f.metadata().await?.len();
    let start = len.saturating_sub(max);
    f.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    f.take(max).read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Crash / watch / reload notifications. A notifier without a transport
/// drops everything silently; delivery failures are audited only.
#[derive(Clone)]
pub struct Notifier {
    transport: Option<Arc<dyn MailTransport>>,
    audit: AuditLog,
}

impl Notifier {
    pub fn new(transport: Option<Arc<dyn MailTransport>>, audit: AuditLog) -> Self {
        Self { transport, audit }
    }

    pub fn command_died(&self, command: &str, log_file: &Path) -> Option<tokio::task::JoinHandle<()>> {
        self.send_with_tail(
            format!("[restarter] command dies: {command}"),
            "Log tail: \n\n",
            log_file.to_path_buf(),
        )
    }

    pub fn watch_touched(&self, command: &str, log_file: &Path) -> Option<tokio::task::JoinHandle<()>> {
        self.send_with_tail(
            format!("[restarter] watch file touched, restarting command: {command}"),
            "Log tail:\n\n",
            log_file.to_path_buf(),
        )
    }

    pub fn global_watch_touched(&self, global_log: Option<&Path>) -> Option<tokio::task::JoinHandle<()>> {
        let subject = "[restarter] global watch file touched, reloading restarter".to_string();
        match global_log {
            Some(p) => self.send_with_tail(subject, "Log tail: \n\n", p.to_path_buf()),
            None => self.send(subject, "Log tail: \n\n".to_string()),
        }
    }

    /// Sends in a background task; an unreadable log is skipped, as there
    /// is nothing to show.
    fn send_with_tail(&self, subject: String, prefix: &'static str, log: PathBuf) -> Option<tokio::task::JoinHandle<()>> {
        let transport = self.transport.clone()?;
        let audit = self.audit.clone();
        Some(tokio::spawn(async move {
            let tail = match tail_file(&log, TAIL_BYTES).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(log = %log.display(), "no log tail for notification: {e}");
                    return;
                }
            };
            deliver(transport.as_ref(), &audit, &subject, &format!("{prefix}{tail}")).await;
        }))
    }

    fn send(&self, subject: String, body: String) -> Option<tokio::task::JoinHandle<()>> {
        let transport = self.transport.clone()?;
        let audit = self.audit.clone();
        Some(tokio::spawn(async move {
            deliver(transport.as_ref(), &audit, &subject, &body).await;
        }))
    }
}

async fn deliver(transport: &dyn MailTransport, audit: &AuditLog, subject: &str, body: &str) {
    audit.event("email", format!("Sending email: {subject}"));
    if let Err(e) = transport.send(subject, body).await {
        audit.event("email", format!("SEND EMAIL ERROR: {e:#}"));
    }
}
