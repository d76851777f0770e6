//! Outbound messaging: opt-out registry, safe send, and email forwarding.
//!
//! # SQLite Write Pattern
//!
//! `phones` and `outbound_messages` use direct pool writes. Idempotency rests
//! on the unique `client_ref` column rather than an in-process lock, so two
//! gateway processes sharing the database still send at most once per key.

pub mod dispatcher;
pub mod mailer;
pub mod opt_out;

use serde::{Deserialize, Serialize};

/// One safe-send request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient; normalized to E.164 before anything else happens.
    pub to: String,
    /// Message text.
    pub text: String,
    /// Idempotency key. Replays with the same key never reach the carrier twice.
    pub client_ref: Option<String>,
    /// Sender number; falls back to the configured default.
    pub from: Option<String>,
    /// Public media URLs for MMS.
    #[serde(default)]
    pub media_urls: Vec<String>,
}

impl SendRequest {
    /// Plain SMS with no idempotency key.
    pub fn new(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Attach an idempotency key.
    #[must_use]
    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    /// Send from a specific number.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Why a send did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendBlockReason {
    /// Recipient replied STOP and has not resubscribed.
    OptedOut,
    /// The carrier refused or failed the request.
    ProviderError,
    /// Another request with the same key is still talking to the carrier.
    InFlight,
}

impl SendBlockReason {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptedOut => "opted_out",
            Self::ProviderError => "provider_error",
            Self::InFlight => "in_flight",
        }
    }
}

/// Result of [`dispatcher::MessageDispatcher::send`].
///
/// A blocked send is a business outcome: callers branch on `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    /// Whether the carrier accepted (now or on an earlier attempt) the message.
    pub ok: bool,
    /// Adapter that handled the send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Carrier message id.
    #[serde(rename = "messageSid", skip_serializing_if = "Option::is_none")]
    pub message_sid: Option<String>,
    /// Set when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SendBlockReason>,
}

impl SendOutcome {
    /// Accepted by the carrier.
    pub fn sent(provider: impl Into<String>, message_sid: impl Into<String>) -> Self {
        Self {
            ok: true,
            provider: Some(provider.into()),
            message_sid: Some(message_sid.into()),
            reason: None,
        }
    }

    /// Not sent.
    pub fn blocked(reason: SendBlockReason, provider: Option<String>) -> Self {
        Self {
            ok: false,
            provider,
            message_sid: None,
            reason: Some(reason),
        }
    }
}
