use chrono::Local;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

pub(crate) fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string()
}

pub(crate) fn format_line(component: &str, msg: &str) -> String {
    format!("{} [{component}] {msg}", timestamp())
}

/// Supervisor-level audit trail.
///
/// Every line is emitted as a tracing event. When a global log file is
/// configured the line is also appended to it by a writer task, one
/// open-append-close per line so external rotation never strands a handle.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl AuditLog {
    /// Must be called inside a tokio runtime when `path` is set.
    pub fn open(path: Option<&Path>) -> Self {
        let Some(target) = path.map(Path::to_path_buf) else {
            return Self::stderr_only();
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if let Err(e) = append_bytes(&target, line.as_bytes()).await {
                    tracing::warn!(path = %target.display(), "audit log append failed: {e:#}");
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn stderr_only() -> Self {
        Self { tx: None }
    }

    pub fn event(&self, component: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(target: "restarter::audit", component, "{msg}");
        if let Some(tx) = &self.tx {
            let _ = tx.send(format_line(component, msg));
        }
    }
}

/// Appends `data` to `path`, creating it (and its parent) when missing.
pub(crate) async fn append_bytes(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use anyhow::Context as _;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
    }
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))?;
    f.write_all(data).await?;
    f.flush().await?;
    Ok(())
}
