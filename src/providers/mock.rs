//! Non-functional fallback adapter.
//!
//! Used whenever no carrier is configured. Reads succeed with nothing;
//! every mutating call fails synchronously with [`ProviderError::NotConfigured`].

use async_trait::async_trait;

use super::{
    AvailableNumber, CarrierAdapter, OutboundSms, ProviderError, PurchasedNumber, SearchFilter,
    SentMessage,
};

/// Adapter name reported by the mock.
pub const MOCK_PROVIDER: &str = "mock";

/// Fallback adapter with no upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockAdapter;

#[async_trait]
impl CarrierAdapter for MockAdapter {
    fn name(&self) -> &str {
        MOCK_PROVIDER
    }

    fn is_functional(&self) -> bool {
        false
    }

    async fn search_available(
        &self,
        _filter: &SearchFilter,
    ) -> Result<Vec<AvailableNumber>, ProviderError> {
        Ok(Vec::new())
    }

    async fn purchase_number(&self, _e164: &str) -> Result<PurchasedNumber, ProviderError> {
        Err(ProviderError::NotConfigured(
            "cannot purchase numbers without a configured carrier".to_owned(),
        ))
    }

    async fn release_number(&self, _provider_ref: &str) -> Result<(), ProviderError> {
        Err(ProviderError::NotConfigured(
            "cannot release numbers without a configured carrier".to_owned(),
        ))
    }

    async fn send_raw(&self, _message: &OutboundSms) -> Result<SentMessage, ProviderError> {
        Err(ProviderError::NotConfigured(
            "cannot send messages without a configured carrier".to_owned(),
        ))
    }
}
