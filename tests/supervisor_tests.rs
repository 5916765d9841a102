use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use restarter::sup::config::EmailSettings;
use restarter::sup::daemon::{Daemon, MailerFactory, NOT_SERVED};
use restarter::sup::notifier::{MailTransport, SendFuture};
use restarter::sup::record::read_pid_file;
use restarter::sup::rpc::{client_call, Command, Reply};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<String>>,
}

impl MailTransport for Outbox {
    fn send<'a>(&'a self, subject: &'a str, _body: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(subject.to_string());
            Ok(())
        })
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    sock: PathBuf,
    config: PathBuf,
}

impl Fixture {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn script(&self, name: &str, secs: u32) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, format!("#!/bin/sh\necho started {name}\nexec sleep {secs}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn restartable(&self, name: &str, secs: u32) -> serde_json::Value {
        let script = self.script(name, secs);
        serde_json::json!({
            "command": script.display().to_string(),
            "pid_file": format!("{name}.pid"),
            "log_file": format!("{name}.log"),
            "watch_file": format!("{name}.watch"),
            "signal": "SIGTERM",
        })
    }

    fn write_config(&self, restartables: Vec<serde_json::Value>) {
        self.write_config_with(restartables, serde_json::json!({}));
    }

    /// Like `write_config`, with `extra` keys merged over the defaults.
    fn write_config_with(&self, restartables: Vec<serde_json::Value>, extra: serde_json::Value) {
        let mut doc = serde_json::json!({
            "server_sock": self.sock,
            "global_log_file": self.path("restarter.log"),
            "global_working_directory": self.dir.path(),
            "keep_alive": true,
            "email_notification": {"host": "mail.invalid", "from": "r@example.com", "to": "ops@example.com"},
            "restartables": restartables,
        });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            doc.extend(extra.clone());
        }
        std::fs::write(&self.config, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    }
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("restarter.sock");
    let config = dir.path().join("restarter.json");
    Fixture { dir, sock, config }
}

fn spawn_daemon(fx: &Fixture, outbox: Arc<Outbox>) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let mailer: MailerFactory = Arc::new(move |_: &EmailSettings| outbox.clone() as Arc<dyn MailTransport>);
    let daemon = Daemon::new(&fx.config)
        .with_mailer(mailer)
        .with_exit_grace(Duration::from_millis(100));
    tokio::spawn(daemon.run())
}

async fn call(sock: &Path, command: Command) -> Reply {
    client_call(sock, &command).await.unwrap()
}

async fn success(sock: &Path, command: Command) -> String {
    match call(sock, command).await {
        Reply::Success(s) => s,
        Reply::Error(e) => panic!("unexpected error reply: {e}"),
    }
}

/// Polls until `f` yields a value or ten seconds pass.
async fn eventually<T, F, Fut>(mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(v) = f().await {
            return v;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

async fn pid_of(fx: &Fixture, name: &str) -> u32 {
    let pid_file = fx.path(&format!("{name}.pid"));
    eventually(|| read_pid_file(&pid_file)).await
}

async fn new_pid(fx: &Fixture, name: &str, old: u32) -> u32 {
    let pid_file = fx.path(&format!("{name}.pid"));
    eventually(|| {
        let pid_file = pid_file.clone();
        async move { read_pid_file(&pid_file).await.filter(|p| *p != old) }
    })
    .await
}

async fn raw_request(sock: &Path, bytes: &[u8]) -> String {
    let mut stream = tokio::net::UnixStream::connect(sock).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervises_restarts_and_exits() {
    let fx = fixture();
    fx.write_config(vec![fx.restartable("alpha", 30), fx.restartable("beta", 31)]);
    let outbox = Arc::new(Outbox::default());
    let daemon = spawn_daemon(&fx, outbox.clone());

    let alpha = pid_of(&fx, "alpha").await;
    let beta = pid_of(&fx, "beta").await;
    eventually(|| async { fx.sock.exists().then_some(()) }).await;

    let status = success(&fx.sock, Command::Status).await;
    assert!(status.starts_with("\nCurrently running:\n\n"), "{status:?}");
    assert!(status.contains(&format!("alpha ]  is alive at: {alpha}\n")), "{status}");
    assert!(status.contains(&format!("beta ]  is alive at: {beta}\n")), "{status}");

    // Child output lands in its own log file.
    let alpha_log = fx.path("alpha.log");
    eventually(|| async {
        std::fs::read_to_string(&alpha_log)
            .ok()
            .filter(|s| s.contains("started alpha"))
    })
    .await;

    // An external kill is noticed by the sweep and answered with a fresh spawn.
    kill(Pid::from_raw(alpha as i32), Signal::SIGKILL).unwrap();
    let alpha2 = new_pid(&fx, "alpha", alpha).await;
    assert_ne!(alpha, alpha2);
    eventually(|| async {
        outbox
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.starts_with("[restarter] command dies:") && s.contains("alpha"))
            .then_some(())
    })
    .await;

    // A client stop keeps the command down across sweeps.
    let stopped = success(&fx.sock, Command::Stop { pattern: Some("alpha".into()) }).await;
    assert!(stopped.contains(&format!("alpha ] at: {alpha2} will be stopped!")), "{stopped}");
    assert!(!stopped.contains("beta"));
    tokio::time::sleep(Duration::from_millis(4500)).await;
    let status = success(&fx.sock, Command::Status).await;
    assert!(status.contains("alpha ]  is dead!"), "{status}");
    assert_eq!(read_pid_file(&fx.path("alpha.pid")).await, Some(alpha2));

    let started = success(&fx.sock, Command::Start { pattern: Some("alpha".into()) }).await;
    assert!(started.contains("alpha ] will be started."), "{started}");
    assert!(!started.contains("beta"));
    let alpha3 = new_pid(&fx, "alpha", alpha2).await;

    // Touching a watch file restarts just that command.
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(fx.path("beta.watch"), "touch").unwrap();
    let beta2 = new_pid(&fx, "beta", beta).await;
    assert_ne!(beta, beta2);
    assert_eq!(read_pid_file(&fx.path("alpha.pid")).await, Some(alpha3));

    assert_eq!(
        call(&fx.sock, Command::Stop { pattern: None }).await,
        Reply::Error("specify a matching regex on the command you want to stop".into())
    );
    assert!(matches!(
        call(&fx.sock, Command::Stop { pattern: Some("(".into()) }).await,
        Reply::Error(e) if e.starts_with("invalid regex")
    ));
    assert_eq!(
        raw_request(&fx.sock, b"{\"command\":[\"bogus\"]}\n").await.trim_end(),
        r#"{"error":"unknown command"}"#
    );
    assert_eq!(
        raw_request(&fx.sock, b"not json\n").await.trim_end(),
        r#"{"error":"bad command"}"#
    );

    let log = success(&fx.sock, Command::Log { pattern: Some("beta".into()) }).await;
    assert!(log.starts_with("Log file output for: "), "{log}");
    assert!(log.contains("[spawn] spawn pid="), "{log}");
    assert!(matches!(
        call(&fx.sock, Command::Log { pattern: Some("nomatch".into()) }).await,
        Reply::Error(e) if e == "no restartable matches: nomatch"
    ));

    let bye = success(&fx.sock, Command::Exit).await;
    assert!(bye.starts_with("\nStopping the following:\n\n"), "{bye}");
    assert!(bye.ends_with("\nrestarter is exiting!!\n\n"), "{bye}");
    daemon.await.unwrap().unwrap();
    assert!(!fx.sock.exists());

    let gone = |pid: u32| kill(Pid::from_raw(pid as i32), None).is_err();
    eventually(|| async { (gone(alpha3) && gone(beta2)).then_some(()) }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_picks_up_new_configuration() {
    let fx = fixture();
    fx.write_config(vec![fx.restartable("one", 30)]);
    let daemon = spawn_daemon(&fx, Arc::new(Outbox::default()));

    let one = pid_of(&fx, "one").await;
    eventually(|| async { fx.sock.exists().then_some(()) }).await;

    fx.write_config(vec![fx.restartable("one", 30), fx.restartable("two", 30)]);
    let reply = success(&fx.sock, Command::Reload).await;
    assert_eq!(reply, "stopping everything, re-reading configuration, and restarting restarter");

    let one2 = new_pid(&fx, "one", one).await;
    let two = pid_of(&fx, "two").await;
    let status = eventually(|| async {
        match client_call(&fx.sock, &Command::Status).await {
            Ok(Reply::Success(s)) if s.contains("two ]  is alive") => Some(s),
            _ => None,
        }
    })
    .await;
    assert!(status.contains(&format!("one ]  is alive at: {one2}")), "{status}");
    assert!(status.contains(&format!("two ]  is alive at: {two}")), "{status}");

    // A broken document on reload keeps the running configuration.
    std::fs::write(&fx.config, "{ not json").unwrap();
    success(&fx.sock, Command::Reload).await;
    let one3 = new_pid(&fx, "one", one2).await;
    let status = eventually(|| async {
        match client_call(&fx.sock, &Command::Status).await {
            Ok(Reply::Success(s)) if s.contains(&format!("one ]  is alive at: {one3}")) => Some(s),
            _ => None,
        }
    })
    .await;
    assert!(status.contains("two ]  is alive"), "{status}");
    let audit_log = fx.path("restarter.log");
    eventually(|| async {
        std::fs::read_to_string(&audit_log)
            .ok()
            .filter(|s| s.contains("keeping previous configuration"))
    })
    .await;

    success(&fx.sock, Command::Exit).await;
    daemon.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_daemon_on_a_live_socket_fails() {
    let fx = fixture();
    fx.write_config(vec![]);
    let first = spawn_daemon(&fx, Arc::new(Outbox::default()));
    eventually(|| async { fx.sock.exists().then_some(()) }).await;
    // Wait until the first daemon is actually answering.
    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;

    let err = Daemon::new(&fx.config).run().await.unwrap_err();
    assert!(err.to_string().contains("already running"), "{err:#}");

    success(&fx.sock, Command::Exit).await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_config_is_fatal() {
    let fx = fixture();
    let err = Daemon::new(&fx.config).run().await.unwrap_err();
    assert!(err.to_string().contains("failed to read config"), "{err:#}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_held_across_reload_still_gets_a_reply() {
    let fx = fixture();
    fx.write_config(vec![]);
    let daemon = spawn_daemon(&fx, Arc::new(Outbox::default()));
    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;

    // Accepted by the first generation, but the request only arrives after
    // that generation has been torn down by the reload.
    let mut early = tokio::net::UnixStream::connect(&fx.sock).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    success(&fx.sock, Command::Reload).await;
    early.write_all(b"{\"command\":[\"status\"]}\n").await.unwrap();
    let mut out = String::new();
    early.read_to_string(&mut out).await.unwrap();
    let reply: Reply = serde_json::from_str(out.trim_end()).unwrap();
    assert_eq!(reply, Reply::Error(NOT_SERVED.to_string()));

    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;
    success(&fx.sock, Command::Exit).await;
    daemon.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_without_command_is_dropped_silently() {
    let fx = fixture();
    fx.write_config(vec![]);
    let daemon = spawn_daemon(&fx, Arc::new(Outbox::default()));
    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;

    assert_eq!(raw_request(&fx.sock, b"{\"cmd\":[\"status\"]}\n").await, "");
    // The daemon keeps serving afterwards.
    success(&fx.sock, Command::Status).await;

    success(&fx.sock, Command::Exit).await;
    daemon.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn touching_global_watch_file_reloads_everything() {
    let fx = fixture();
    fx.write_config_with(
        vec![fx.restartable("one", 30)],
        serde_json::json!({"global_watch_file": "reload.touch"}),
    );
    let outbox = Arc::new(Outbox::default());
    let daemon = spawn_daemon(&fx, outbox.clone());

    let one = pid_of(&fx, "one").await;
    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;
    // The marker is created relative to the working directory.
    assert!(fx.path("reload.touch").exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(fx.path("reload.touch"), "touch").unwrap();
    let one2 = new_pid(&fx, "one", one).await;
    assert_ne!(one, one2);
    eventually(|| async {
        outbox
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == "[restarter] global watch file touched, reloading restarter")
            .then_some(())
    })
    .await;
    let audit_log = fx.path("restarter.log");
    eventually(|| async {
        std::fs::read_to_string(&audit_log)
            .ok()
            .filter(|s| s.contains("global watch file updated"))
    })
    .await;

    eventually(|| async {
        match client_call(&fx.sock, &Command::Status).await {
            Ok(Reply::Success(s)) if s.contains(&format!("one ]  is alive at: {one2}")) => Some(()),
            _ => None,
        }
    })
    .await;
    success(&fx.sock, Command::Exit).await;
    daemon.await.unwrap().unwrap();
}

async fn terminated_by(signal: Signal) {
    let fx = fixture();
    fx.write_config(vec![fx.restartable("child", 30)]);
    let mut proc = tokio::process::Command::new(env!("CARGO_BIN_EXE_restarter"))
        .arg("-c")
        .arg(&fx.config)
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let child = pid_of(&fx, "child").await;
    eventually(|| async { client_call(&fx.sock, &Command::Status).await.ok() }).await;

    kill(Pid::from_raw(proc.id().unwrap() as i32), signal).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), proc.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success(), "{status:?}");
    assert!(!fx.sock.exists());
    eventually(|| async { exited(child).then_some(()) }).await;
}

/// Gone, or a zombie left for whoever inherited it.
fn exited(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| stat.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')))
        .unwrap_or(true)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sigterm_stops_children_and_exits_cleanly() {
    terminated_by(Signal::SIGTERM).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sigint_stops_children_and_exits_cleanly() {
    terminated_by(Signal::SIGINT).await;
}
