//! Adapter resolution and mock fallback behaviour.

use std::sync::Arc;

use async_trait::async_trait;

use numgate::config::{ProviderConfig, TwilioConfig};
use numgate::providers::gateway::ProviderGateway;
use numgate::providers::mock::{MockAdapter, MOCK_PROVIDER};
use numgate::providers::twilio::TWILIO_PROVIDER;
use numgate::providers::{
    AvailableNumber, CarrierAdapter, OutboundSms, ProviderError, PurchasedNumber, SearchFilter,
    SentMessage,
};

/// Named adapter that accepts everything.
struct NamedCarrier(&'static str);

#[async_trait]
impl CarrierAdapter for NamedCarrier {
    fn name(&self) -> &str {
        self.0
    }

    async fn search_available(
        &self,
        _filter: &SearchFilter,
    ) -> Result<Vec<AvailableNumber>, ProviderError> {
        Ok(Vec::new())
    }

    async fn purchase_number(&self, e164: &str) -> Result<PurchasedNumber, ProviderError> {
        Ok(PurchasedNumber {
            e164: e164.to_owned(),
            provider_ref: format!("{}-ref", self.0),
        })
    }

    async fn release_number(&self, _provider_ref: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send_raw(&self, _message: &OutboundSms) -> Result<SentMessage, ProviderError> {
        Ok(SentMessage {
            provider_message_id: format!("{}-msg", self.0),
        })
    }
}

fn sample_sms() -> OutboundSms {
    OutboundSms {
        from: Some("+15550001111".to_owned()),
        to: "+15550002222".to_owned(),
        body: "hello".to_owned(),
        media_urls: Vec::new(),
    }
}

#[test]
fn empty_config_degrades_to_mock() {
    let gateway = ProviderGateway::from_config(&ProviderConfig::default());
    assert_eq!(gateway.default_name(), MOCK_PROVIDER);
    assert!(!gateway.is_configured());
    assert_eq!(gateway.available_names(), vec![MOCK_PROVIDER.to_owned()]);
}

#[test]
fn twilio_without_credentials_is_not_registered() {
    let config = ProviderConfig {
        default: TWILIO_PROVIDER.to_owned(),
        twilio: Some(TwilioConfig {
            account_sid: "AC123".to_owned(),
            ..TwilioConfig::default()
        }),
    };
    let gateway = ProviderGateway::from_config(&config);
    assert!(!gateway.has_provider(TWILIO_PROVIDER));
    assert_eq!(gateway.default_name(), MOCK_PROVIDER);
}

#[test]
fn twilio_with_credentials_becomes_default() {
    let config = ProviderConfig {
        default: TWILIO_PROVIDER.to_owned(),
        twilio: Some(TwilioConfig {
            account_sid: "AC123".to_owned(),
            auth_token: "token".to_owned(),
            ..TwilioConfig::default()
        }),
    };
    let gateway = ProviderGateway::from_config(&config);
    assert_eq!(gateway.default_name(), TWILIO_PROVIDER);
    assert!(gateway.is_configured());
    assert!(gateway.has_provider(MOCK_PROVIDER));
}

#[test]
fn unknown_name_resolves_to_default() {
    let gateway = ProviderGateway::with_default(Arc::new(NamedCarrier("alpha")));
    assert_eq!(gateway.resolve(Some("nope")).name(), "alpha");
    assert_eq!(gateway.resolve(None).name(), "alpha");
    assert_eq!(gateway.resolve(Some(MOCK_PROVIDER)).name(), MOCK_PROVIDER);
}

#[test]
fn registered_adapter_resolves_by_name() {
    let mut gateway = ProviderGateway::with_default(Arc::new(NamedCarrier("alpha")));
    gateway.register(Arc::new(NamedCarrier("beta")));
    assert_eq!(gateway.resolve(Some("beta")).name(), "beta");
    assert_eq!(
        gateway.available_names(),
        vec!["alpha".to_owned(), "beta".to_owned(), MOCK_PROVIDER.to_owned()]
    );
}

#[tokio::test]
async fn mock_refuses_every_mutation() {
    let mock = MockAdapter;
    assert!(!mock.is_functional());

    let found = mock.search_available(&SearchFilter::default()).await;
    assert!(matches!(found, Ok(ref numbers) if numbers.is_empty()));

    assert!(matches!(
        mock.purchase_number("+15550001111").await,
        Err(ProviderError::NotConfigured(_))
    ));
    assert!(matches!(
        mock.release_number("PN1").await,
        Err(ProviderError::NotConfigured(_))
    ));
    assert!(matches!(
        mock.send_raw(&sample_sms()).await,
        Err(ProviderError::NotConfigured(_))
    ));
}
