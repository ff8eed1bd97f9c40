//! Inbound webhook ingestion (SPEC_FULL.md §4.4): authenticate, parse,
//! dispatch. Idempotency is structural — every state-advancing action is
//! CAS-gated, so repeated deliveries converge on the same end state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::providers::{NormalizedStatus, ProviderAdapter};
use crate::store::Store;
use crate::types::PaymentStatus;

use super::payment_service::PaymentService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handled; respond 200.
    Handled,
    /// Malformed body; respond 400.
    BadRequest,
    /// Failed authentication; respond 403.
    Unauthorized,
}

pub struct WebhookService {
    store: Store,
    payment_service: Arc<PaymentService>,
}

impl WebhookService {
    pub fn new(store: Store, payment_service: Arc<PaymentService>) -> Self {
        WebhookService { store, payment_service }
    }

    pub async fn handle(
        &self,
        provider: &dyn ProviderAdapter,
        headers: &HashMap<String, String>,
        body: &[u8],
        remote_ip: Option<IpAddr>,
    ) -> WebhookOutcome {
        if !provider.verify_webhook(headers, body, remote_ip) {
            warn!(provider = provider.name(), "webhook authentication failed");
            return WebhookOutcome::Unauthorized;
        }

        let (provider_payment_id, status) = match provider.parse_webhook(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "webhook body rejected");
                return WebhookOutcome::BadRequest;
            }
        };

        if status == NormalizedStatus::Unknown || provider_payment_id.is_empty() {
            // Recognized-but-irrelevant event (e.g. CryptoBot update_type we
            // don't act on). Acknowledge so the provider stops retrying.
            return WebhookOutcome::Handled;
        }

        let payment = match self.store.payments.get_by_payment_id(&provider_payment_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(provider = provider.name(), provider_payment_id, "webhook for unknown payment");
                return WebhookOutcome::Handled;
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "store error while handling webhook");
                return WebhookOutcome::Handled;
            }
        };

        match status {
            NormalizedStatus::Paid => {
                // Platega's only authentication signal is a confirmed
                // status observed against our own record of the payment
                // (SPEC_FULL.md §4.4) — the CAS below is exactly that check.
                let won = match self
                    .store
                    .payments
                    .try_update_status(&payment.payment_id, PaymentStatus::Paid, PaymentStatus::Pending)
                    .await
                {
                    Ok(won) => won,
                    Err(e) => {
                        warn!(error = %e, "failed to apply pending->paid transition");
                        return WebhookOutcome::Handled;
                    }
                };

                if !won {
                    // Either already paid (another delivery raced us) or
                    // already completed; either way this delivery is a
                    // duplicate and should be acknowledged, not retried.
                    if payment.status == PaymentStatus::Completed {
                        return WebhookOutcome::Handled;
                    }
                }

                self.payment_service.on_paid(&payment.payment_id).await;
                WebhookOutcome::Handled
            }
            NormalizedStatus::Failed => {
                if let Err(e) = self
                    .store
                    .payments
                    .try_update_status(&payment.payment_id, PaymentStatus::Failed, PaymentStatus::Pending)
                    .await
                {
                    warn!(error = %e, "failed to apply pending->failed transition");
                }
                WebhookOutcome::Handled
            }
            NormalizedStatus::Pending | NormalizedStatus::Unknown => {
                info!(provider = provider.name(), "webhook acknowledged with no state change");
                WebhookOutcome::Handled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BotHandleTransport, Notifier};
    use crate::providers::YooKassaAdapter;
    use crate::services::payment_service::ProviderRegistry;
    use crate::store::SqliteStore;
    use crate::types::*;
    use crate::vpn::DefaultVpnAdapterFactory;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sample_payment(payment_id: &str) -> Payment {
        let now = 1_700_000_000;
        Payment {
            id: 0,
            payment_id: payment_id.to_string(),
            user_id: 1,
            tariff_id: 1,
            amount: 1000,
            currency: Currency::Rub,
            email: None,
            status: PaymentStatus::Pending,
            country: None,
            protocol: Some(VpnProtocol::V2ray),
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            metadata: Metadata::new(),
            subscription_id: None,
        }
    }

    async fn build() -> (WebhookService, Store, YooKassaAdapter) {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Store {
            payments: sqlite.clone(),
            subscriptions: sqlite.clone(),
            keys: sqlite.clone(),
            catalog: sqlite.clone(),
        };
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let notifier = Arc::new(Notifier::new(vec![Arc::new(BotHandleTransport::new(tx))], None));
        let vpn_factory = Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(5)));
        let purchase_service = Arc::new(super::super::SubscriptionPurchaseService::new(
            store.clone(),
            vpn_factory.clone(),
            notifier.clone(),
            "vpn.example".to_string(),
            None,
        ));
        let new_provider = || {
            YooKassaAdapter::new(
                "shop".to_string(),
                "".to_string(), // fake mode
                Some("secret".to_string()),
                "https://return.example".to_string(),
            )
        };
        let provider = new_provider();
        let mut adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(PaymentProvider::Yookassa, Arc::new(new_provider()));
        let providers = Arc::new(ProviderRegistry::new(adapters));
        let payment_service = Arc::new(PaymentService::new(
            store.clone(),
            providers,
            purchase_service,
            vpn_factory,
            notifier,
        ));
        let webhook_service = WebhookService::new(store.clone(), payment_service);
        (webhook_service, store, provider)
    }

    #[tokio::test]
    async fn idempotent_duplicate_paid_webhook_does_not_advance_twice() {
        let (service, store, provider) = build().await;
        let payment = sample_payment("pay_wh_1");
        store.payments.create(&payment).await.unwrap();

        let body = serde_json::json!({
            "event": "payment.succeeded",
            "object": { "id": "pay_wh_1" }
        })
        .to_string();
        let mut headers = HashMap::new();
        headers.insert("x-yookassa-secret".to_string(), "secret".to_string());

        let first = service.handle(&provider, &headers, body.as_bytes(), None).await;
        let second = service.handle(&provider, &headers, body.as_bytes(), None).await;

        assert_eq!(first, WebhookOutcome::Handled);
        assert_eq!(second, WebhookOutcome::Handled);

        let final_payment = store.payments.get_by_payment_id("pay_wh_1").await.unwrap().unwrap();
        assert_ne!(final_payment.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn missing_auth_is_rejected() {
        let (service, store, provider) = build().await;
        let payment = sample_payment("pay_wh_2");
        store.payments.create(&payment).await.unwrap();

        let body = serde_json::json!({
            "event": "payment.succeeded",
            "object": { "id": "pay_wh_2" }
        })
        .to_string();
        let outcome = service.handle(&provider, &HashMap::new(), body.as_bytes(), None).await;
        assert_eq!(outcome, WebhookOutcome::Unauthorized);
    }
}
