//! Inbound webhook handling: STOP/HELP/START compliance and forwarding.
//!
//! The processor always produces an acknowledgement. Carrier retries are
//! cheaper to prevent than to deduplicate, so domain failures are logged and
//! swallowed here instead of being surfaced to the transport.

pub mod forwarding;
pub mod keywords;
pub mod processor;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use keywords::KeywordClass;

/// One media attachment on an inbound MMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMedia {
    /// Carrier-hosted media URL.
    pub url: String,
    /// MIME type, when the carrier sent one.
    pub content_type: Option<String>,
}

/// Parsed form fields of an inbound SMS/MMS webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundPayload {
    /// Sender as delivered (not yet normalized).
    pub from: String,
    /// Recipient as delivered (not yet normalized).
    pub to: String,
    /// Message text.
    pub body: String,
    /// Carrier message id. Missing ids cannot be deduplicated.
    pub message_sid: Option<String>,
    /// Attachments in `MediaUrl{n}` order.
    pub media: Vec<InboundMedia>,
}

impl InboundPayload {
    /// Build from decoded `application/x-www-form-urlencoded` fields.
    ///
    /// Accepts `SmsMessageSid` when `MessageSid` is absent. `NumMedia` bounds
    /// the attachment scan; missing or unparsable counts read as zero.
    pub fn from_form(fields: &HashMap<String, String>) -> Self {
        let field = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let message_sid = fields
            .get("MessageSid")
            .or_else(|| fields.get("SmsMessageSid"))
            .map(|sid| sid.trim().to_owned())
            .filter(|sid| !sid.is_empty());
        let num_media: u32 = fields
            .get("NumMedia")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0);
        let media = (0..num_media)
            .filter_map(|n| {
                fields.get(&format!("MediaUrl{n}")).map(|url| InboundMedia {
                    url: url.clone(),
                    content_type: fields.get(&format!("MediaContentType{n}")).cloned(),
                })
            })
            .collect();
        Self {
            from: field("From"),
            to: field("To"),
            body: field("Body"),
            message_sid,
            media,
        }
    }
}

/// What the processor did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundOutcome {
    /// Malformed numbers or missing message id; nothing stored.
    Dropped,
    /// Redelivery of a message already processed.
    Duplicate,
    /// Compliance keyword handled.
    Keyword(KeywordClass),
    /// Ordinary content stored (and possibly forwarded).
    Stored,
    /// Processing failed after the message was accepted; logged only.
    Failed,
}

/// Synchronous acknowledgement returned to the carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAck {
    /// Compliance reply text, when one is due.
    pub reply: Option<String>,
    /// Processing outcome, for logging and tests.
    pub outcome: InboundOutcome,
}

impl InboundAck {
    /// Ack with no reply.
    pub fn silent(outcome: InboundOutcome) -> Self {
        Self {
            reply: None,
            outcome,
        }
    }

    /// Render the TwiML response body.
    pub fn to_twiml(&self) -> String {
        match &self.reply {
            Some(text) => format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>{}</Message></Response>",
                escape_xml(text)
            ),
            None => "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_owned(),
        }
    }
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
