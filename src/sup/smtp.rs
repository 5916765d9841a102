//! [`MailTransport`] over SMTP. `ssl: true` connects with implicit TLS
//! (port 465 unless `host` names one); otherwise plain SMTP on port 25.

use crate::sup::config::EmailSettings;
use crate::sup::notifier::{MailTransport, SendFuture};
use anyhow::Context as _;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SmtpTransport {
    settings: EmailSettings,
}

impl SmtpTransport {
    pub fn new(settings: EmailSettings) -> Self {
        Self { settings }
    }

    /// `host` or `host:port`.
    fn host_port(&self) -> (&str, Option<u16>) {
        let host = self.settings.host.trim();
        match host.rsplit_once(':') {
            Some((h, port)) => match port.parse::<u16>() {
                Ok(p) => (h, Some(p)),
                Err(_) => (host, None),
            },
            None => (host, None),
        }
    }

    fn recipients(&self) -> Vec<&str> {
        self.settings
            .to
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn message(&self, subject: &str, body: &str) -> anyhow::Result<Message> {
        let from: Mailbox = self
            .settings
            .from
            .trim()
            .parse()
            .with_context(|| format!("invalid from address {:?}", self.settings.from))?;
        let mut builder = Message::builder().from(from).subject(subject);
        let rcpts = self.recipients();
        anyhow::ensure!(!rcpts.is_empty(), "no recipients configured");
        for rcpt in rcpts {
            let to: Mailbox = rcpt
                .parse()
                .with_context(|| format!("invalid recipient address {rcpt:?}"))?;
            builder = builder.to(to);
        }
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("build message")
    }

    fn transport(&self) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
        let (host, port) = self.host_port();
        let mut builder = if self.settings.ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .with_context(|| format!("smtp relay {host}"))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        if let Some(port) = port {
            builder = builder.port(port);
        }
        if let Some(user) = self.settings.user.as_deref().filter(|u| !u.is_empty()) {
            let password = self.settings.password.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(user.to_string(), password));
        }
        Ok(builder
            .hello_name(ClientId::Domain("restarter".to_string()))
            .timeout(Some(IO_TIMEOUT))
            .build())
    }

    async fn deliver(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let message = self.message(subject, body)?;
        let transport = self.transport()?;
        transport
            .send(message)
            .await
            .with_context(|| format!("smtp delivery via {}", self.settings.host))?;
        Ok(())
    }
}

impl MailTransport for SmtpTransport {
    fn send<'a>(&'a self, subject: &'a str, body: &'a str) -> SendFuture<'a> {
        Box::pin(self.deliver(subject, body))
    }
}
