//! Twilio adapter using the `2010-04-01` REST API.
//!
//! Requests are form-encoded with HTTP basic auth (account SID + auth token).
//! The client carries a hard request timeout so a hung purchase or send
//! surfaces as [`ProviderError::Request`] instead of blocking the caller.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::TwilioConfig;
use crate::phone::area_code_of;

use super::{
    check_http_response, AvailableNumber, Capability, CarrierAdapter, NumberType, OutboundSms,
    ProviderError, PurchasedNumber, SearchFilter, SentMessage,
};

/// Adapter name for Twilio.
pub const TWILIO_PROVIDER: &str = "twilio";

const API_VERSION: &str = "2010-04-01";

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Page of `AvailablePhoneNumbers` results.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct AvailableNumbersPage {
    /// Offered numbers.
    #[serde(default)]
    pub available_phone_numbers: Vec<TwilioAvailableNumber>,
}

/// One offered number.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct TwilioAvailableNumber {
    /// E.164 number.
    pub phone_number: String,
    /// Rate center / city.
    pub locality: Option<String>,
    /// State or region code.
    pub region: Option<String>,
    /// ISO country.
    pub iso_country: String,
    /// Capability flags.
    #[serde(default)]
    pub capabilities: TwilioCapabilities,
}

/// Capability flags as Twilio reports them (`SMS`/`MMS` upper-case, `voice` lower).
#[doc(hidden)]
#[derive(Debug, Default, Deserialize)]
pub struct TwilioCapabilities {
    /// SMS support.
    #[serde(rename = "SMS", alias = "sms", default)]
    pub sms: bool,
    /// MMS support.
    #[serde(rename = "MMS", alias = "mms", default)]
    pub mms: bool,
    /// Voice support.
    #[serde(default)]
    pub voice: bool,
}

/// `IncomingPhoneNumbers` resource.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct IncomingPhoneNumber {
    /// Resource SID (`PN...`).
    pub sid: String,
    /// Purchased number.
    pub phone_number: String,
}

/// `Messages` resource.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct TwilioMessage {
    /// Message SID (`SM...`/`MM...`).
    pub sid: String,
    /// Delivery status at creation time.
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Twilio carrier adapter.
#[derive(Clone)]
pub struct TwilioAdapter {
    account_sid: String,
    auth_token: String,
    messaging_service_sid: Option<String>,
    base_url: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for TwilioAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioAdapter")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("messaging_service_sid", &self.messaging_service_sid)
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl TwilioAdapter {
    /// Build the adapter from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Rejected`] for an unparseable base URL and
    /// [`ProviderError::Request`] if the HTTP client cannot be built.
    pub fn from_config(config: &TwilioConfig) -> Result<Self, ProviderError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ProviderError::Rejected(format!("invalid twilio base_url: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            messaging_service_sid: config.messaging_service_sid.clone(),
            base_url,
            client,
        })
    }

    fn account_url(&self, tail: &str) -> Result<Url, ProviderError> {
        let path = format!("/{API_VERSION}/Accounts/{}/{tail}", self.account_sid);
        self.base_url
            .join(&path)
            .map_err(|e| ProviderError::Rejected(format!("invalid twilio url {path}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Request / Response builders (pub for integration testing)
// ---------------------------------------------------------------------------

/// Resource path (relative to the account) for an inventory search.
#[doc(hidden)]
pub fn search_path(filter: &SearchFilter) -> String {
    let category = match filter.number_type {
        NumberType::Local => "Local",
        NumberType::TollFree => "TollFree",
        NumberType::Mobile => "Mobile",
    };
    format!(
        "AvailablePhoneNumbers/{}/{category}.json",
        filter.iso_country.trim().to_ascii_uppercase()
    )
}

/// Query parameters for an inventory search.
#[doc(hidden)]
pub fn search_query(filter: &SearchFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(area_code) = filter.area_code.as_deref().filter(|a| !a.is_empty()) {
        query.push(("AreaCode".to_owned(), area_code.to_owned()));
    }
    for capability in &filter.capabilities {
        let key = match capability {
            Capability::Sms => "SmsEnabled",
            Capability::Mms => "MmsEnabled",
            Capability::Voice => "VoiceEnabled",
        };
        query.push((key.to_owned(), "true".to_owned()));
    }
    query.push(("PageSize".to_owned(), filter.limit.clamp(1, 50).to_string()));
    query
}

/// Form body for a `Messages` create call.
///
/// # Errors
///
/// Returns [`ProviderError::Rejected`] when neither a `from` number nor a
/// messaging service is available.
#[doc(hidden)]
pub fn send_form(
    message: &OutboundSms,
    messaging_service_sid: Option<&str>,
) -> Result<Vec<(String, String)>, ProviderError> {
    let mut form = vec![
        ("To".to_owned(), message.to.clone()),
        ("Body".to_owned(), message.body.clone()),
    ];
    match (message.from.as_deref(), messaging_service_sid) {
        (Some(from), _) => form.push(("From".to_owned(), from.to_owned())),
        (None, Some(service)) => form.push(("MessagingServiceSid".to_owned(), service.to_owned())),
        (None, None) => {
            return Err(ProviderError::Rejected(
                "no sender: set `from` or a messaging service".to_owned(),
            ))
        }
    }
    for url in &message.media_urls {
        form.push(("MediaUrl".to_owned(), url.clone()));
    }
    Ok(form)
}

/// Parse an `AvailablePhoneNumbers` page into domain results.
///
/// # Errors
///
/// Returns [`ProviderError::Parse`] when the body is not the expected JSON.
#[doc(hidden)]
pub fn parse_available(body: &str) -> Result<Vec<AvailableNumber>, ProviderError> {
    let page: AvailableNumbersPage = serde_json::from_str(body)
        .map_err(|e| ProviderError::Parse(format!("available numbers: {e}")))?;
    Ok(page
        .available_phone_numbers
        .into_iter()
        .map(|n| {
            let mut capabilities = Vec::new();
            if n.capabilities.sms {
                capabilities.push(Capability::Sms);
            }
            if n.capabilities.mms {
                capabilities.push(Capability::Mms);
            }
            if n.capabilities.voice {
                capabilities.push(Capability::Voice);
            }
            AvailableNumber {
                area_code: area_code_of(&n.phone_number).map(str::to_owned),
                e164: n.phone_number,
                provider: TWILIO_PROVIDER.to_owned(),
                iso_country: n.iso_country,
                capabilities,
                locality: n.locality,
                region: n.region,
            }
        })
        .collect())
}

#[async_trait]
impl CarrierAdapter for TwilioAdapter {
    fn name(&self) -> &str {
        TWILIO_PROVIDER
    }

    async fn search_available(
        &self,
        filter: &SearchFilter,
    ) -> Result<Vec<AvailableNumber>, ProviderError> {
        let url = self.account_url(&search_path(filter))?;
        let response = self
            .client
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .query(&search_query(filter))
            .send()
            .await?;
        let body = check_http_response(response).await?;
        let numbers = parse_available(&body)?;
        debug!(count = numbers.len(), "twilio inventory search");
        Ok(numbers)
    }

    async fn purchase_number(&self, e164: &str) -> Result<PurchasedNumber, ProviderError> {
        let url = self.account_url("IncomingPhoneNumbers.json")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("PhoneNumber", e164)])
            .send()
            .await?;
        let body = check_http_response(response).await?;
        let resource: IncomingPhoneNumber = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Parse(format!("incoming phone number: {e}")))?;
        debug!(sid = %resource.sid, "twilio number purchased");
        Ok(PurchasedNumber {
            e164: resource.phone_number,
            provider_ref: resource.sid,
        })
    }

    async fn release_number(&self, provider_ref: &str) -> Result<(), ProviderError> {
        let url = self.account_url(&format!("IncomingPhoneNumbers/{provider_ref}.json"))?;
        let response = self
            .client
            .delete(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?;
        check_http_response(response).await?;
        debug!(sid = provider_ref, "twilio number released");
        Ok(())
    }

    async fn send_raw(&self, message: &OutboundSms) -> Result<SentMessage, ProviderError> {
        let form = send_form(message, self.messaging_service_sid.as_deref())?;
        let url = self.account_url("Messages.json")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;
        let body = check_http_response(response).await?;
        let created: TwilioMessage = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Parse(format!("message: {e}")))?;
        debug!(sid = %created.sid, status = ?created.status, "twilio message accepted");
        Ok(SentMessage {
            provider_message_id: created.sid,
        })
    }
}
