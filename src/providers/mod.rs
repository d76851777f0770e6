//! Upstream carrier abstraction layer.
//!
//! Defines the [`CarrierAdapter`] trait and the shared request/response types
//! used by all adapters. Two adapters are implemented:
//! - [`twilio::TwilioAdapter`]: Twilio 2010-04-01 REST API
//! - [`mock::MockAdapter`]: always-present fallback when nothing is configured
//!
//! The [`gateway::ProviderGateway`] resolves adapters by name and falls back
//! to the mock so call sites never branch on configuration presence.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod gateway;
pub mod mock;
pub mod twilio;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// A messaging or voice capability of a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Text messages.
    Sms,
    /// Picture/multimedia messages.
    Mms,
    /// Voice calls.
    Voice,
}

impl Capability {
    /// Returns the lowercase name used in storage and query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Mms => "mms",
            Self::Voice => "voice",
        }
    }

    /// Parse a lowercase capability name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(Self::Sms),
            "mms" => Some(Self::Mms),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }
}

/// Upstream inventory category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberType {
    /// Geographic local number.
    #[default]
    Local,
    /// Toll-free number.
    TollFree,
    /// Mobile-range number.
    Mobile,
}

/// Inventory search criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Restrict to a NANP area code.
    pub area_code: Option<String>,
    /// ISO 3166 alpha-2 country.
    pub iso_country: String,
    /// Capabilities every result must have.
    pub capabilities: Vec<Capability>,
    /// Inventory category.
    pub number_type: NumberType,
    /// Maximum number of results.
    pub limit: u32,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            area_code: None,
            iso_country: "US".to_owned(),
            capabilities: vec![Capability::Sms],
            number_type: NumberType::Local,
            limit: 20,
        }
    }
}

/// A number offered by upstream inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableNumber {
    /// Number in E.164.
    pub e164: String,
    /// Which adapter returned it.
    pub provider: String,
    /// Area code, when the number is NANP.
    pub area_code: Option<String>,
    /// ISO 3166 alpha-2 country.
    pub iso_country: String,
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// City or rate center, when known.
    pub locality: Option<String>,
    /// State or region, when known.
    pub region: Option<String>,
}

/// Result of a successful upstream purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchasedNumber {
    /// Number in E.164.
    pub e164: String,
    /// Upstream identifier for later release.
    pub provider_ref: String,
}

/// One outbound message handed to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSms {
    /// Sender number; `None` lets the adapter pick (e.g. a messaging service).
    pub from: Option<String>,
    /// Recipient in E.164.
    pub to: String,
    /// Message text.
    pub body: String,
    /// Public media URLs for MMS.
    pub media_urls: Vec<String>,
}

/// Result of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Provider-assigned message identifier.
    pub provider_message_id: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by carrier adapters.
///
/// Adapters never retry; the caller owns retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure, including timeouts.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// No functional provider is configured for this operation.
    #[error("messaging provider not configured: {0}")]
    NotConfigured(String),
    /// The request was refused before reaching the network.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure, `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

/// Collapse whitespace, redact credential-shaped tokens, and truncate.
pub fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"AC[0-9a-fA-F]{32}",
        r"SK[0-9a-fA-F]{32}",
        r"KEY[0-9A-Z]{26}",
        r"Basic [A-Za-z0-9+/=]{16,}",
        r"Bearer [A-Za-z0-9._\-]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Uniform interface over one upstream carrier.
///
/// Implementations must be `Send + Sync`; a single instance is shared by
/// every request handler.
#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    /// Adapter name as used in configuration and `PhoneNumber.provider`.
    fn name(&self) -> &str;

    /// Whether mutating calls can succeed at all.
    fn is_functional(&self) -> bool {
        true
    }

    /// Query upstream inventory. Read-only.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on API, network, or parse failure.
    async fn search_available(
        &self,
        filter: &SearchFilter,
    ) -> Result<Vec<AvailableNumber>, ProviderError>;

    /// Buy a number so this account owns it.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the purchase fails.
    async fn purchase_number(&self, e164: &str) -> Result<PurchasedNumber, ProviderError>;

    /// Give a purchased number back to the carrier.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the release fails.
    async fn release_number(&self, provider_ref: &str) -> Result<(), ProviderError>;

    /// Hand one message to the carrier.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the carrier refuses or cannot be reached.
    async fn send_raw(&self, message: &OutboundSms) -> Result<SentMessage, ProviderError>;
}
