//! Carrier compliance keyword classification.

use serde::{Deserialize, Serialize};

const STOP_WORDS: &[&str] = &[
    "STOP",
    "STOPALL",
    "UNSUBSCRIBE",
    "CANCEL",
    "END",
    "QUIT",
    "REVOKE",
];
const HELP_WORDS: &[&str] = &["HELP", "INFO"];
const START_WORDS: &[&str] = &["START", "UNSTOP", "RESUME", "YES"];

/// Compliance class of an inbound body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordClass {
    /// Opt out.
    Stop,
    /// Ask for help; no state change.
    Help,
    /// Opt back in.
    Start,
}

impl KeywordClass {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Help => "HELP",
            Self::Start => "START",
        }
    }
}

/// Uppercase and drop everything that is not an ASCII letter or digit.
pub fn normalize_body(body: &str) -> String {
    body.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Classify a message body. The whole normalized body must equal a keyword;
/// `"stop it"` is ordinary content after normalization (`STOPIT`).
pub fn classify(body: &str) -> Option<KeywordClass> {
    let normalized = normalize_body(body);
    let word = normalized.as_str();
    if STOP_WORDS.contains(&word) {
        Some(KeywordClass::Stop)
    } else if HELP_WORDS.contains(&word) {
        Some(KeywordClass::Help)
    } else if START_WORDS.contains(&word) {
        Some(KeywordClass::Start)
    } else {
        None
    }
}
