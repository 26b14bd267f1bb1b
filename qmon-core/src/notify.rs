//! Notification channels: one `send(title, body, severity)` contract with
//! console, webhook and SMTP implementations.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use thiserror::Error;

use crate::config::{ChannelKind, ChannelSettings};
use crate::model::Severity;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("invalid message: {0}")]
    Message(String),
    #[error("channel misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, title: &str, body: &str, severity: Severity) -> Result<(), ChannelError>;
}

/// Builds the channel described by `settings`, regardless of `enabled`.
pub fn channel_from_settings(
    name: &str,
    settings: &ChannelSettings,
) -> Result<Box<dyn NotificationChannel>, ChannelError> {
    match settings.kind {
        ChannelKind::Console => Ok(Box::new(ConsoleChannel::new(name))),
        ChannelKind::Webhook => {
            let url = settings
                .url
                .clone()
                .ok_or_else(|| ChannelError::Config("webhook requires `url`".into()))?;
            Ok(Box::new(WebhookChannel::new(name, url)))
        }
        ChannelKind::Email => {
            let host = settings
                .smtp_host
                .as_deref()
                .ok_or_else(|| ChannelError::Config("email requires `smtp_host`".into()))?;
            let from = settings
                .from
                .clone()
                .ok_or_else(|| ChannelError::Config("email requires `from`".into()))?;
            Ok(Box::new(EmailChannel::new(
                name,
                host,
                settings.smtp_port.unwrap_or(587),
                settings.username.as_deref(),
                settings.password.as_deref(),
                from,
                settings.to.clone(),
            )?))
        }
    }
}

/// Writes alerts to the process log.
#[derive(Debug)]
pub struct ConsoleChannel {
    name: String,
}

impl ConsoleChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str, severity: Severity) -> Result<(), ChannelError> {
        match severity {
            Severity::Critical => {
                tracing::error!(target: "alerts", channel = %self.name, %title, %body, "alert triggered")
            }
            Severity::Warning => {
                tracing::warn!(target: "alerts", channel = %self.name, %title, %body, "alert triggered")
            }
        }
        Ok(())
    }
}

/// Posts a chat-style JSON payload (`{"text": ...}`) to a webhook URL.
#[derive(Debug)]
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str, severity: Severity) -> Result<(), ChannelError> {
        let payload = json!({
            "text": format!("*{title}*\n{body}"),
            "title": title,
            "severity": severity.as_str(),
        });
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Plain-text alert mail through SMTP. Port 465 uses implicit TLS, any other
/// port negotiates STARTTLS.
pub struct EmailChannel {
    name: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: Vec<String>,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl EmailChannel {
    pub fn new(
        name: impl Into<String>,
        smtp_host: &str,
        smtp_port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: impl Into<String>,
        to: Vec<String>,
    ) -> Result<Self, ChannelError> {
        let mut builder = if smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)?
        }
        .port(smtp_port)
        .timeout(Some(Duration::from_secs(15)));

        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        Ok(Self {
            name: name.into(),
            transport: builder.build(),
            from: from.into(),
            to,
        })
    }

    /// One message per recipient. An unusable recipient yields an error in
    /// its slot without affecting the others.
    fn messages(
        &self,
        title: &str,
        body: &str,
    ) -> Result<Vec<(&str, Result<Message, ChannelError>)>, ChannelError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|err| ChannelError::Message(format!("from: {err}")))?;
        Ok(self
            .to
            .iter()
            .map(|recipient| {
                let message = recipient
                    .parse::<Mailbox>()
                    .map_err(|err| ChannelError::Message(format!("to {recipient}: {err}")))
                    .and_then(|to| {
                        Message::builder()
                            .from(from.clone())
                            .to(to)
                            .subject(title)
                            .header(ContentType::TEXT_PLAIN)
                            .body(body.to_string())
                            .map_err(|err| ChannelError::Message(err.to_string()))
                    });
                (recipient.as_str(), message)
            })
            .collect())
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    /// Every recipient is attempted; the first failure is returned.
    async fn send(&self, title: &str, body: &str, _severity: Severity) -> Result<(), ChannelError> {
        let mut first_error = None;
        for (recipient, message) in self.messages(title, body)? {
            let delivered = match message {
                Ok(email) => self
                    .transport
                    .send(email)
                    .await
                    .map(|_| ())
                    .map_err(ChannelError::from),
                Err(err) => Err(err),
            };
            if let Err(err) = delivered {
                tracing::warn!(
                    target: "alerts",
                    channel = %self.name,
                    recipient,
                    error = %err,
                    "email delivery failed"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn console_channel_always_succeeds() {
        let channel = ConsoleChannel::new("console");
        channel
            .send("[qmon][warning] r", "body", Severity::Warning)
            .await
            .unwrap();
        assert_eq!(channel.name(), "console");
    }

    #[test]
    fn webhook_without_url_is_rejected() {
        let settings = ChannelSettings::new(ChannelKind::Webhook, true);
        assert!(matches!(
            channel_from_settings("hook", &settings),
            Err(ChannelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_webhook_reports_error() {
        let channel = WebhookChannel::new("hook", "http://127.0.0.1:9/unreachable");
        let result = channel.send("t", "b", Severity::Critical).await;
        assert!(result.is_err());
    }

    fn email_channel(port: u16, to: &[&str]) -> EmailChannel {
        EmailChannel::new(
            "mail",
            "127.0.0.1",
            port,
            None,
            None,
            "qmon@example.com",
            to.iter().map(|r| r.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn bad_recipient_does_not_block_the_rest() {
        let channel = email_channel(2525, &["not an address", "ops@example.com"]);
        let messages = channel.messages("[qmon][critical] r", "body").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "not an address");
        assert!(matches!(messages[0].1, Err(ChannelError::Message(_))));
        assert_eq!(messages[1].0, "ops@example.com");
        assert!(messages[1].1.is_ok());
    }

    #[tokio::test]
    async fn email_attempts_every_recipient_and_returns_first_error() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        // Accepts and immediately hangs up, so every delivery fails.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let channel = email_channel(port, &["not an address", "ops@example.com"]);
        let result = channel.send("t", "b", Severity::Critical).await;
        assert!(matches!(result, Err(ChannelError::Message(_))));
        assert!(connections.load(Ordering::SeqCst) >= 1);
    }
}
