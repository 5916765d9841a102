use crate::sup::audit::AuditLog;
use crate::sup::build_info;
use crate::sup::config::{load_config, Config, EmailSettings};
use crate::sup::controller;
use crate::sup::health::{self, LivenessProbe, SignalProbe, SWEEP_INTERVAL};
use crate::sup::notifier::{tail_file, MailTransport, Notifier, TAIL_BYTES};
use crate::sup::record::ProcessRecord;
use crate::sup::rpc::{self, Command, DecodeError, Decoded, Reply, BAD_COMMAND, UNKNOWN_COMMAND};
use crate::sup::smtp::SmtpTransport;
use crate::sup::watch::{self, WatchSet, WatchTarget};
use anyhow::Context as _;
use regex::Regex;
use std::fs;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Time between the `exit` reply and the supervisor returning.
pub const EXIT_GRACE: Duration = Duration::from_secs(1);

const RELOAD_REPLY: &str = "stopping everything, re-reading configuration, and restarting restarter";

/// Answer for requests that reached a generation after it stopped serving.
pub const NOT_SERVED: &str = "restarter is reloading or shutting down, command was not run";

pub type MailerFactory = Arc<dyn Fn(&EmailSettings) -> Arc<dyn MailTransport> + Send + Sync>;

/// Everything that reaches the record-owning task. Handled one at a time,
/// so no two mutations of a record ever interleave.
pub(crate) enum SupervisorCmd {
    Client {
        command: Command,
        resp: oneshot::Sender<Reply>,
    },
    HealthTick,
    Watch(WatchTarget),
    Terminate(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Reload,
    Exit,
}

/// Entry point: supervises until `exit` (or SIGTERM/SIGINT), reloading in
/// place as often as asked. Only the first configuration load and the first
/// boot can fail.
pub async fn run_daemon_async(config_path: &Path) -> anyhow::Result<()> {
    Daemon::new(config_path).run().await
}

/// Daemon settings that survive reloads.
#[derive(Clone)]
pub struct Daemon {
    config_path: PathBuf,
    probe: Arc<dyn LivenessProbe>,
    mailer: MailerFactory,
    exit_grace: Duration,
}

impl Daemon {
    pub fn new(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            probe: Arc::new(SignalProbe),
            mailer: Arc::new(|s: &EmailSettings| Arc::new(SmtpTransport::new(s.clone())) as Arc<dyn MailTransport>),
            exit_grace: EXIT_GRACE,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_mailer(mut self, mailer: MailerFactory) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut current = load_config(&self.config_path)?;
        let mut sup = Supervisor::boot(current.clone(), &self, None).await?;
        loop {
            match sup.run().await {
                Outcome::Exit => return Ok(()),
                Outcome::Reload => {}
            }
            let (next, note) = match load_config(&self.config_path) {
                Ok(cfg) => (cfg, None),
                Err(e) => {
                    tracing::error!("reload failed, keeping previous configuration: {e}");
                    (current.clone(), Some(format!("reload failed, keeping previous configuration: {e}")))
                }
            };
            sup = match Supervisor::boot(next.clone(), &self, note).await {
                Ok(s) => {
                    current = next;
                    s
                }
                Err(e) => {
                    tracing::error!("boot of reloaded configuration failed: {e:#}");
                    let note = format!("boot of reloaded configuration failed, keeping previous: {e:#}");
                    Supervisor::boot(current.clone(), &self, Some(note)).await?
                }
            };
        }
    }
}

struct ControlServer {
    sock: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControlServer {
    async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let _ = fs::remove_file(&self.sock);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = fs::remove_file(&self.sock);
        }
    }
}

/// One configuration generation: built on boot, discarded on reload.
struct Supervisor {
    cfg: Config,
    records: Vec<ProcessRecord>,
    audit: AuditLog,
    notifier: Notifier,
    probe: Arc<dyn LivenessProbe>,
    exit_grace: Duration,
    rx: mpsc::UnboundedReceiver<SupervisorCmd>,
    background: Vec<JoinHandle<()>>,
    watches: WatchSet,
    server: ControlServer,
}

impl Supervisor {
    async fn boot(cfg: Config, daemon: &Daemon, note: Option<String>) -> anyhow::Result<Self> {
        let audit = AuditLog::open(cfg.global_log_file.as_deref());
        audit.event(
            "boot",
            format!("{} config={}", build_info::banner(), daemon.config_path.display()),
        );
        if let Some(note) = note {
            audit.event("boot", note);
        }

        let transport = cfg.email_notification.as_ref().map(|s| (daemon.mailer)(s));
        let notifier = Notifier::new(transport, audit.clone());

        let records = cfg
            .restartables
            .iter()
            .map(ProcessRecord::from_spec)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let sock = cfg.socket_path();
        prepare_socket(&sock)?;
        let listener = UnixListener::bind(&sock)
            .with_context(|| format!("failed to bind socket {}", sock.display()))?;

        let (tx, rx) = mpsc::unbounded_channel::<SupervisorCmd>();
        let mut background = vec![];

        if cfg.keep_alive {
            let tick_tx = tx.clone();
            background.push(health::spawn_ticker(SWEEP_INTERVAL, move || {
                tick_tx.send(SupervisorCmd::HealthTick).is_ok()
            }));
        }
        background.push(spawn_signal_listener(tx.clone(), audit.clone()));

        let mut watch_entries: Vec<(PathBuf, WatchTarget)> = vec![];
        if let Some(global) = &cfg.global_watch_file {
            match watch::ensure_marker(global) {
                Ok(_) => watch_entries.push((global.clone(), WatchTarget::Global)),
                Err(e) => audit.event("watch", format!("global watch file unavailable err={e:#}")),
            }
        }
        for (idx, rec) in records.iter().enumerate() {
            let Some(path) = &rec.watch_file else {
                continue;
            };
            match watch::ensure_marker(path) {
                Ok(_) => watch_entries.push((path.clone(), WatchTarget::Record(idx))),
                Err(e) => audit.event(
                    "watch",
                    format!("watch file unavailable command={} err={e:#}", rec.command),
                ),
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_task = tokio::spawn(accept_loop(listener, tx.clone(), audit.clone(), shutdown_rx));
        audit.event("rpc", format!("listening sock={}", sock.display()));

        let mut sup = Self {
            cfg,
            records,
            audit,
            notifier,
            probe: Arc::clone(&daemon.probe),
            exit_grace: daemon.exit_grace,
            rx,
            background,
            watches: WatchSet::empty(),
            server: ControlServer {
                sock,
                shutdown: Some(shutdown_tx),
                task: Some(server_task),
            },
        };

        // A stale pid file from an earlier run is stopped before the fresh spawn.
        for rec in &mut sup.records {
            controller::restart(rec, &sup.audit).await;
        }

        let watch_tx = tx;
        sup.watches = watch::register(&watch_entries, &sup.audit, move |target| {
            watch_tx.send(SupervisorCmd::Watch(target)).is_ok()
        });
        for path in sup.watches.watched() {
            sup.audit.event("watch", format!("watching path={}", path.display()));
        }
        Ok(sup)
    }

    async fn run(mut self) -> Outcome {
        while let Some(cmd) = self.rx.recv().await {
            let outcome = match cmd {
                SupervisorCmd::HealthTick => {
                    self.keep_alive_sweep().await;
                    None
                }
                SupervisorCmd::Watch(WatchTarget::Record(idx)) => {
                    self.watch_restart(idx).await;
                    None
                }
                SupervisorCmd::Watch(WatchTarget::Global) => {
                    self.audit.event("watch", "global watch file updated");
                    self.notifier.global_watch_touched(self.cfg.global_log_file.as_deref());
                    self.teardown_for_reload("global watch file touched").await;
                    Some(Outcome::Reload)
                }
                SupervisorCmd::Client { command, resp } => self.handle_client(command, resp).await,
                SupervisorCmd::Terminate(why) => {
                    self.stop_all_running(&format!("stopping all processes because {why}")).await;
                    self.close_background().await;
                    Some(Outcome::Exit)
                }
            };
            if let Some(o) = outcome {
                return o;
            }
        }
        Outcome::Exit
    }

    async fn handle_client(&mut self, command: Command, resp: oneshot::Sender<Reply>) -> Option<Outcome> {
        let reply = match command {
            Command::Status => self.status(),
            Command::Stop { pattern } => self.stop_matching(pattern.as_deref()).await,
            Command::Start { pattern } => self.start_matching(pattern.as_deref()).await,
            Command::Log { pattern } => self.log_tail(pattern.as_deref()).await,
            Command::Unrecognized(_) => Reply::Error(UNKNOWN_COMMAND.to_string()),
            Command::Reload => {
                let _ = resp.send(Reply::Success(RELOAD_REPLY.to_string()));
                self.teardown_for_reload("client issued a reload").await;
                return Some(Outcome::Reload);
            }
            Command::Exit => {
                let mut status = self
                    .stop_all_running("stopping all processes because client issued a remote command")
                    .await;
                status.push_str("\nrestarter is exiting!!\n\n");
                let _ = resp.send(Reply::Success(status));
                self.close_background().await;
                tokio::time::sleep(self.exit_grace).await;
                return Some(Outcome::Exit);
            }
        };
        let _ = resp.send(reply);
        None
    }

    fn running(&self) -> Vec<bool> {
        health::sweep(&self.records, self.probe.as_ref())
    }

    fn status(&self) -> Reply {
        let running = self.running();
        let mut out = String::from("\nCurrently running:\n\n");
        for (rec, alive) in self.records.iter().zip(&running) {
            let Some(pid) = rec.pid else {
                continue;
            };
            if *alive {
                out.push_str(&format!("\t[ {} ]  is alive at: {pid}\n", rec.command));
            } else {
                out.push_str(&format!("\t[ {} ]  is dead!\n", rec.command));
            }
        }
        Reply::Success(out)
    }

    async fn stop_matching(&mut self, pattern: Option<&str>) -> Reply {
        let re = match compile(pattern, "stop") {
            Ok(re) => re,
            Err(reply) => return reply,
        };
        let running = self.running();
        let mut out = String::from("\nStopping the following:\n\n");
        for (idx, alive) in running.into_iter().enumerate() {
            let rec = &mut self.records[idx];
            let Some(pid) = rec.pid else {
                continue;
            };
            if !alive || !re.is_match(&rec.command) {
                continue;
            }
            out.push_str(&format!("\t[ {} ] at: {pid} will be stopped!\n", rec.command));
            rec.ignore = true;
            controller::stop(rec, &self.audit).await;
        }
        Reply::Success(out)
    }

    async fn start_matching(&mut self, pattern: Option<&str>) -> Reply {
        let re = match compile(pattern, "start") {
            Ok(re) => re,
            Err(reply) => return reply,
        };
        let running = self.running();
        let mut out = String::from("\nStarting the following:\n\n");
        for (idx, alive) in running.into_iter().enumerate() {
            let rec = &mut self.records[idx];
            if alive || !re.is_match(&rec.command) {
                continue;
            }
            out.push_str(&format!("\t[ {} ] will be started.\n", rec.command));
            rec.ignore = false;
            controller::start(rec, &self.audit).await;
        }
        Reply::Success(out)
    }

    /// Tails the global log. A pattern only picks which command labels it.
    async fn log_tail(&self, pattern: Option<&str>) -> Reply {
        let label = match pattern {
            None => None,
            Some(p) => {
                let re = match Regex::new(p) {
                    Ok(re) => re,
                    Err(e) => return Reply::Error(format!("invalid regex {p}: {e}")),
                };
                match self.records.iter().find(|r| re.is_match(&r.command)) {
                    Some(rec) => Some(rec.command.clone()),
                    None => return Reply::Error(format!("no restartable matches: {p}")),
                }
            }
        };
        let tail = match &self.cfg.global_log_file {
            Some(path) => tail_file(path, TAIL_BYTES).await.ok(),
            None => None,
        };
        match (label, tail) {
            (None, Some(t)) => Reply::Success(format!("Log file output for restarter system\n\n{t}")),
            (None, None) => Reply::Error("missing log file for restarter system".to_string()),
            (Some(cmd), Some(t)) => Reply::Success(format!("Log file output for: {cmd}\n\n{t}")),
            (Some(cmd), None) => Reply::Error(format!("missing log file for: {cmd}")),
        }
    }

    async fn keep_alive_sweep(&mut self) {
        if !self.cfg.keep_alive {
            return;
        }
        let running = self.running();
        for idx in health::crashed(&self.records, &running) {
            let rec = &mut self.records[idx];
            let pid = rec.pid.unwrap_or_default();
            self.audit.event(
                "keepalive",
                format!("keep alive command died pid={pid} command={}", rec.command),
            );
            self.audit.event("keepalive", format!("rerunning command={}", rec.command));
            controller::restart(rec, &self.audit).await;
            self.notifier.command_died(&rec.command, &rec.log_file);
        }
    }

    /// Watch-file restarts ignore the `ignore` flag and leave it untouched.
    async fn watch_restart(&mut self, idx: usize) {
        let Some(rec) = self.records.get_mut(idx) else {
            return;
        };
        self.audit.event("watch", format!("watch file updated command={}", rec.command));
        controller::restart(rec, &self.audit).await;
        self.notifier.watch_touched(&rec.command, &rec.log_file);
    }

    /// Marks every running record ignored and signals it. Returns the
    /// listing used by `exit`.
    async fn stop_all_running(&mut self, reason: &str) -> String {
        self.audit.event("shutdown", reason);
        let running = self.running();
        let mut out = String::from("\nStopping the following:\n\n");
        for (idx, alive) in running.into_iter().enumerate() {
            let rec = &mut self.records[idx];
            let Some(pid) = rec.pid else {
                continue;
            };
            if !alive {
                continue;
            }
            out.push_str(&format!("\t[ {} ] at: {pid} will be stopped!\n", rec.command));
            rec.ignore = true;
            controller::stop(rec, &self.audit).await;
        }
        out
    }

    async fn teardown_for_reload(&mut self, why: &str) {
        for t in self.background.drain(..) {
            t.abort();
        }
        self.server.close().await;
        self.refuse_pending();
        self.audit.event("reload", why);
        self.audit.event("reload", "stopping all processes because of reload");
        for rec in &self.records {
            controller::stop(rec, &self.audit).await;
        }
        self.watches = WatchSet::empty();
    }

    async fn close_background(&mut self) {
        for t in self.background.drain(..) {
            t.abort();
        }
        self.watches = WatchSet::empty();
        self.server.close().await;
        self.refuse_pending();
        self.audit.event("shutdown", format!("closed sock={}", self.server.sock.display()));
    }

    /// Closes the command channel and answers every request still queued on
    /// it. Later senders see the closed channel and answer for themselves.
    fn refuse_pending(&mut self) {
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            if let SupervisorCmd::Client { resp, .. } = cmd {
                let _ = resp.send(Reply::Error(NOT_SERVED.to_string()));
            }
        }
    }
}

/// Missing or invalid patterns turn into the error reply.
fn compile(pattern: Option<&str>, verb: &str) -> Result<Regex, Reply> {
    let Some(p) = pattern else {
        return Err(Reply::Error(format!(
            "specify a matching regex on the command you want to {verb}"
        )));
    };
    Regex::new(p).map_err(|e| Reply::Error(format!("invalid regex {p}: {e}")))
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        }
    }
    if sock.exists() {
        // Refuse to steal a live socket; clear a stale one.
        if StdUnixStream::connect(sock).is_ok() {
            anyhow::bail!(
                "restarter already running (socket {} is accepting connections)",
                sock.display()
            );
        }
        fs::remove_file(sock)
            .with_context(|| format!("failed to remove stale socket {}", sock.display()))?;
    }
    Ok(())
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::UnboundedSender<SupervisorCmd>,
    audit: AuditLog,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, _addr)) => {
                    let tx = tx.clone();
                    let audit = audit.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, tx, audit).await {
                            tracing::warn!("rpc connection error: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
            _ = &mut shutdown => break,
        }
    }
}

/// One request, at most one reply, then close.
async fn handle_connection(
    mut stream: UnixStream,
    tx: mpsc::UnboundedSender<SupervisorCmd>,
    audit: AuditLog,
) -> anyhow::Result<()> {
    let reply = match rpc::read_request(&mut stream).await {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => return Ok(()),
        Ok(raw) => match rpc::decode(&raw) {
            Ok(Decoded::Command(command)) => {
                let (resp_tx, resp_rx) = oneshot::channel();
                match tx.send(SupervisorCmd::Client { command, resp: resp_tx }) {
                    // The generation went away (exit or reload) before answering.
                    Ok(()) => resp_rx
                        .await
                        .unwrap_or_else(|_| Reply::Error(NOT_SERVED.to_string())),
                    Err(_) => Reply::Error(NOT_SERVED.to_string()),
                }
            }
            Ok(Decoded::NoCommand) => {
                audit.event(
                    "rpc",
                    format!("unknown commands sent from remote client: {}", String::from_utf8_lossy(&raw)),
                );
                return Ok(());
            }
            Err(e) => {
                tracing::debug!("rejecting request: {e}");
                Reply::Error(BAD_COMMAND.to_string())
            }
        },
        Err(DecodeError::Io(e)) => return Err(e.into()),
        Err(DecodeError::TimedOut) => {
            tracing::debug!("client sent no request in time");
            return Ok(());
        }
        Err(e) => {
            tracing::debug!("rejecting request: {e}");
            Reply::Error(BAD_COMMAND.to_string())
        }
    };
    rpc::write_reply(&mut stream, &reply).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<SupervisorCmd>, audit: AuditLog) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut term, mut int) = match (
            unix_signal(SignalKind::terminate()),
            unix_signal(SignalKind::interrupt()),
        ) {
            (Ok(t), Ok(i)) => (t, i),
            (Err(e), _) | (_, Err(e)) => {
                audit.event("boot", format!("signal handlers unavailable err={e}"));
                return;
            }
        };
        let why = tokio::select! {
            _ = term.recv() => "SIGTERM received",
            _ = int.recv() => "SIGINT received",
        };
        let _ = tx.send(SupervisorCmd::Terminate(why));
    })
}
