//! Provider gateway resolving carrier adapters by name.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ProviderConfig;

use super::mock::{MockAdapter, MOCK_PROVIDER};
use super::twilio::TwilioAdapter;
use super::CarrierAdapter;

/// Named set of carrier adapters with a resolved default.
///
/// The mock adapter is always registered, and every lookup that misses
/// resolves to the default, which is itself the mock when no carrier is
/// configured. Callers therefore always get an adapter back.
#[derive(Clone)]
pub struct ProviderGateway {
    adapters: HashMap<String, Arc<dyn CarrierAdapter>>,
    default: String,
}

impl std::fmt::Debug for ProviderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGateway")
            .field("adapters", &self.available_names())
            .field("default", &self.default)
            .finish()
    }
}

impl ProviderGateway {
    /// Build the gateway from provider configuration.
    ///
    /// Never fails: an unknown or unconfigured default degrades to the mock.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut gateway = Self::mock_only();

        if let Some(twilio) = config.twilio.as_ref().filter(|t| t.has_credentials()) {
            match TwilioAdapter::from_config(twilio) {
                Ok(adapter) => {
                    gateway.register(Arc::new(adapter));
                    info!("twilio adapter registered");
                }
                Err(err) => warn!(error = %err, "twilio adapter could not be built"),
            }
        }

        if gateway.adapters.contains_key(&config.default) {
            gateway.default = config.default.clone();
        } else if config.default != MOCK_PROVIDER {
            warn!(
                requested = %config.default,
                "default provider unavailable, falling back to mock adapter"
            );
        }
        info!(default = %gateway.default, "provider gateway ready");
        gateway
    }

    /// Gateway with only the mock adapter.
    pub fn mock_only() -> Self {
        let mut adapters: HashMap<String, Arc<dyn CarrierAdapter>> = HashMap::new();
        adapters.insert(MOCK_PROVIDER.to_owned(), Arc::new(MockAdapter));
        Self {
            adapters,
            default: MOCK_PROVIDER.to_owned(),
        }
    }

    /// Gateway whose default is the given adapter (mock still registered).
    pub fn with_default(adapter: Arc<dyn CarrierAdapter>) -> Self {
        let mut gateway = Self::mock_only();
        gateway.default = adapter.name().to_owned();
        gateway.register(adapter);
        gateway
    }

    /// Add or replace an adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn CarrierAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    /// Resolve an adapter by name, falling back to the default.
    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn CarrierAdapter> {
        if let Some(adapter) = name.and_then(|n| self.adapters.get(n)) {
            return Arc::clone(adapter);
        }
        if let Some(requested) = name {
            warn!(requested, default = %self.default, "unknown provider, using default");
        }
        self.default_adapter()
    }

    /// The default adapter.
    pub fn default_adapter(&self) -> Arc<dyn CarrierAdapter> {
        match self.adapters.get(&self.default) {
            Some(adapter) => Arc::clone(adapter),
            None => Arc::new(MockAdapter),
        }
    }

    /// Name of the default adapter.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Whether a real (non-mock) carrier backs the default.
    pub fn is_configured(&self) -> bool {
        self.default_adapter().is_functional()
    }

    /// All registered adapter names in sorted order.
    pub fn available_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true when the named adapter is registered.
    pub fn has_provider(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }
}
