//! Configuration loading for the gateway.
//!
//! Loads `GatewayConfig` from `$NUMGATE_CONFIG_PATH` or `./numgate.toml`.
//! Precedence: env vars > config file > defaults. The resulting struct is
//! built once at startup and handed to each component by reference.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SQLite location.
    pub database: DatabaseConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
    /// Upstream carrier selection and credentials.
    pub provider: ProviderConfig,
    /// Number pool timings and plan policy.
    pub pool: PoolConfig,
    /// Outbound safe-send settings.
    pub dispatch: DispatchConfig,
    /// Inbound keyword replies and forwarding text.
    pub inbound: InboundConfig,
    /// SMTP relay for email forwarding. Absent means email forwarding is off.
    pub email: Option<EmailConfig>,
}

impl GatewayConfig {
    /// Load configuration with precedence env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (also used to layer `.env` values).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = env("NUMGATE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("numgate.toml"));
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        Ok(config)
    }

    /// Load from a TOML file only. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver so tests never mutate the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("NUMGATE_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = env("NUMGATE_LOGS_DIR") {
            self.logging.logs_dir = PathBuf::from(v);
        }
        if let Some(v) = env("NUMGATE_PROVIDER") {
            self.provider.default = v;
        }

        // Twilio: account SID + auth token presence creates the adapter config.
        if let (Some(sid), Some(token)) = (
            env("NUMGATE_TWILIO_ACCOUNT_SID"),
            env("NUMGATE_TWILIO_AUTH_TOKEN"),
        ) {
            let existing = self.provider.twilio.take().unwrap_or_default();
            self.provider.twilio = Some(TwilioConfig {
                account_sid: sid,
                auth_token: token,
                ..existing
            });
        }
        if let Some(v) = env("NUMGATE_TWILIO_MESSAGING_SERVICE_SID") {
            if let Some(twilio) = self.provider.twilio.as_mut() {
                twilio.messaging_service_sid = Some(v);
            }
        }

        if let Some(v) = env("NUMGATE_DEFAULT_FROM") {
            self.dispatch.default_from = Some(v);
        }
        if let Some(v) = env("NUMGATE_RESERVATION_TTL_MINUTES") {
            match v.parse() {
                Ok(n) => self.pool.reservation_ttl_minutes = n,
                Err(_) => tracing::warn!(
                    var = "NUMGATE_RESERVATION_TTL_MINUTES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("NUMGATE_SMTP_PASSWORD") {
            if let Some(email) = self.email.as_mut() {
                email.smtp_password = v;
            }
        }
    }
}

// ── Sections ────────────────────────────────────────────────────

/// SQLite database location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("numgate.db"),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs.
    pub logs_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// Upstream carrier selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Name of the adapter used when a call does not name one.
    pub default: String,
    /// Twilio credentials, if configured.
    pub twilio: Option<TwilioConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default: "twilio".to_owned(),
            twilio: None,
        }
    }
}

/// Twilio REST API settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    /// Account SID (`AC...`).
    pub account_sid: String,
    /// Auth token paired with the account SID.
    pub auth_token: String,
    /// Messaging service used when a send carries no explicit `from`.
    pub messaging_service_sid: Option<String>,
    /// API base URL, overridable for test doubles.
    pub base_url: String,
    /// Upstream HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl std::fmt::Debug for TwilioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("messaging_service_sid", &self.messaging_service_sid)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            messaging_service_sid: None,
            base_url: default_twilio_base_url(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl TwilioConfig {
    /// Whether both halves of the credential pair are present.
    pub fn has_credentials(&self) -> bool {
        !self.account_sid.trim().is_empty() && !self.auth_token.trim().is_empty()
    }
}

/// Number pool timings and plan policy inputs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Default reservation hold in minutes.
    pub reservation_ttl_minutes: u32,
    /// Cooling-off days applied when a free-plan number is released.
    pub free_hold_days: u32,
    /// Days without traffic before a free-plan number is recycled.
    pub free_inactivity_days: u32,
    /// Plan names treated as premium (numbers locked, never recycled).
    pub premium_plans: Vec<String>,
    /// Plan assumed by the background recycler.
    pub default_plan: String,
    /// Cron expression (with seconds) for the pool sweeper.
    pub sweep_cron: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_minutes: 10,
            free_hold_days: 14,
            free_inactivity_days: 30,
            premium_plans: vec![
                "premium".to_owned(),
                "pro".to_owned(),
                "business".to_owned(),
            ],
            default_plan: "free".to_owned(),
            sweep_cron: "0 */5 * * * *".to_owned(),
        }
    }
}

/// Outbound safe-send settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sender number used when a request carries no `from`.
    pub default_from: Option<String>,
    /// How many times to re-read an in-flight idempotent send.
    pub in_flight_poll_attempts: u32,
    /// Delay between in-flight polls in milliseconds.
    pub in_flight_poll_interval_ms: u64,
    /// Age in seconds after which a `pending` send is presumed abandoned by a
    /// crashed process and may be retried under the same client ref. Keep it
    /// well above the carrier timeout.
    pub pending_stale_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_from: None,
            in_flight_poll_attempts: 10,
            in_flight_poll_interval_ms: 200,
            pending_stale_secs: 120,
        }
    }
}

/// Fixed compliance replies and forwarding text.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Reply to STOP-class keywords.
    pub stop_reply: String,
    /// Reply to HELP-class keywords.
    pub help_reply: String,
    /// Reply to START-class keywords.
    pub start_reply: String,
    /// Subject line for forwarded-message emails.
    pub forward_email_subject: String,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            stop_reply: "You have been unsubscribed and will receive no further messages. \
                         Reply START to resubscribe."
                .to_owned(),
            help_reply: "Reply STOP to unsubscribe or START to resubscribe. \
                         Msg & data rates may apply."
                .to_owned(),
            start_reply: "You have been resubscribed. Reply STOP to unsubscribe.".to_owned(),
            forward_email_subject: "New text message".to_owned(),
        }
    }
}

/// SMTP relay settings for email forwarding.
#[derive(Clone, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username. Empty means an unauthenticated local relay.
    #[serde(default)]
    pub smtp_user: String,
    /// SMTP password.
    #[serde(default)]
    pub smtp_password: String,
    /// Sender mailbox for forwarded messages.
    pub from_address: String,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_user", &self.smtp_user)
            .field("smtp_password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

// Default value functions for serde

fn default_twilio_base_url() -> String {
    "https://api.twilio.com".to_owned()
}
fn default_provider_timeout_secs() -> u64 {
    15
}
fn default_smtp_port() -> u16 {
    587
}
