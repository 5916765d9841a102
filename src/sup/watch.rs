use crate::sup::audit::AuditLog;
use anyhow::Context as _;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coalesces the burst of events a single touch or write produces.
pub const DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchTarget {
    /// The global watch file: reload everything.
    Global,
    /// A restartable's own watch file, by configuration index.
    Record(usize),
}

/// Creates `path` as a one-byte marker file when it does not exist yet.
/// Returns whether a file was created.
pub fn ensure_marker(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }
    }
    std::fs::write(path, b"x").with_context(|| format!("create watch file {}", path.display()))?;
    Ok(true)
}

/// Live file-change registrations. Dropping it unregisters every watch and
/// stops the debouncer.
pub struct WatchSet {
    _watcher: Option<RecommendedWatcher>,
    debouncer: Option<JoinHandle<()>>,
    watched: Vec<PathBuf>,
}

impl WatchSet {
    pub fn empty() -> Self {
        Self {
            _watcher: None,
            debouncer: None,
            watched: vec![],
        }
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

impl Drop for WatchSet {
    fn drop(&mut self) {
        if let Some(t) = self.debouncer.take() {
            t.abort();
        }
    }
}

/// Directory holding `path` and the key its events are reported under.
fn split_watch_path(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let name = path.file_name()?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let key = dir.join(name);
    Some((dir, key))
}

/// Watches the directory of every entry (non-recursive) so a file replaced
/// by rename keeps triggering, and calls `on_fire` once per target per
/// debounced burst. Events for other files in those directories are
/// dropped. `on_fire` returning false ends the debouncer. Registration
/// failures are audited and skipped.
pub fn register<F>(entries: &[(PathBuf, WatchTarget)], audit: &AuditLog, mut on_fire: F) -> WatchSet
where
    F: FnMut(WatchTarget) -> bool + Send + 'static,
{
    if entries.is_empty() {
        return WatchSet::empty();
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            for p in event.paths {
                let _ = tx.send(p);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            audit.event("watch", format!("failed to create file watcher err={e}"));
            return WatchSet::empty();
        }
    };

    let mut routes: HashMap<PathBuf, BTreeSet<WatchTarget>> = HashMap::new();
    let mut dirs: HashMap<PathBuf, bool> = HashMap::new();
    let mut watched: Vec<PathBuf> = vec![];
    for (path, target) in entries {
        let Some((dir, key)) = split_watch_path(path) else {
            audit.event("watch", format!("not a file path path={}", path.display()));
            continue;
        };
        let ok = *dirs.entry(dir.clone()).or_insert_with(|| {
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => true,
                Err(e) => {
                    audit.event("watch", format!("failed to watch path={} err={e}", path.display()));
                    false
                }
            }
        });
        if !ok {
            continue;
        }
        routes.entry(key).or_default().insert(*target);
        if !watched.contains(path) {
            watched.push(path.clone());
        }
    }

    let debouncer = tokio::spawn(async move {
        let lookup = |p: &PathBuf| routes.get(p).cloned().unwrap_or_default();
        while let Some(first) = rx.recv().await {
            let mut fired = lookup(&first);
            if fired.is_empty() {
                continue;
            }
            tokio::time::sleep(DEBOUNCE).await;
            while let Ok(p) = rx.try_recv() {
                fired.extend(lookup(&p));
            }
            for target in fired {
                if !on_fire(target) {
                    return;
                }
            }
        }
    });

    WatchSet {
        _watcher: Some(watcher),
        debouncer: Some(debouncer),
        watched,
    }
}
