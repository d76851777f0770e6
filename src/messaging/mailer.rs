//! Email delivery for forwarded inbound messages.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::EmailConfig;

/// Errors from email delivery.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// No `[email]` section is configured.
    #[error("email forwarding is not configured")]
    NotConfigured,
    /// A sender or recipient address did not parse.
    #[error("invalid address {address:?}: {reason}")]
    Address {
        /// The offending address.
        address: String,
        /// Parser message.
        reason: String,
    },
    /// The message could not be assembled.
    #[error("failed to build email: {0}")]
    Build(String),
    /// The SMTP exchange failed.
    #[error("smtp error: {0}")]
    Transport(String),
}

/// Outbound email channel.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one plain-text email.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`] when the message cannot be built or delivered.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// SMTP mailer backed by `lettre`.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Build the transport. An empty `smtp_user` means an unauthenticated
    /// local relay without TLS.
    ///
    /// # Errors
    ///
    /// Returns [`MailError`] for a bad sender address or relay host.
    pub fn from_config(config: &EmailConfig) -> Result<Self, MailError> {
        let from = parse_mailbox(&config.from_address)?;
        let transport = if config.smtp_user.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                .port(config.smtp_port)
                .build()
        } else {
            let creds = Credentials::new(config.smtp_user.clone(), config.smtp_password.clone());
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| MailError::Transport(e.to_string()))?
                .credentials(creds)
                .port(config.smtp_port)
                .build()
        };
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| MailError::Build(e.to_string()))?;
        self.transport
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        debug!("forwarding email delivered");
        Ok(())
    }
}

/// Stand-in when email is not configured. Every send fails loudly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), MailError> {
        Err(MailError::NotConfigured)
    }
}

/// Pick the mailer for the given configuration.
///
/// # Errors
///
/// Returns [`MailError`] when an `[email]` section is present but invalid.
pub fn build_mailer(config: Option<&EmailConfig>) -> Result<Arc<dyn Mailer>, MailError> {
    match config {
        Some(cfg) => Ok(Arc::new(SmtpMailer::from_config(cfg)?)),
        None => Ok(Arc::new(DisabledMailer)),
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse().map_err(|e: lettre::address::AddressError| MailError::Address {
        address: address.to_owned(),
        reason: e.to_string(),
    })
}
