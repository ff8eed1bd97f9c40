//! Intent creation, provider dispatch, status polling, and the `onPaid`
//! fan-out into either `SubscriptionPurchaseService` or a simple one-off
//! key issuance (SPEC_FULL.md §4.2/§6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{PaymentCoreError, Result};
use crate::notifier::Notifier;
use crate::providers::{CreatePaymentRequest, ProviderAdapter};
use crate::store::Store;
use crate::types::{
    Metadata, OutlineKey, Outcome, Payment, PaymentProvider, PaymentStatus, V2rayKey, VpnProtocol,
    METADATA_KEY_TYPE, METADATA_VALUE_SUBSCRIPTION,
};
use crate::vpn::{CredentialHandle, DefaultVpnAdapterFactory};

use super::SubscriptionPurchaseService;

const DEFAULT_TIMEOUT_MINUTES: u64 = 5;
const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 5;

/// Looks up the concrete adapter for a given provider at dispatch time.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new(adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>>) -> Self {
        ProviderRegistry { adapters }
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| PaymentCoreError::config(format!("no adapter configured for provider {:?}", provider)))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateIntentRequest {
    pub user_id: i64,
    pub tariff_id: i64,
    pub amount_minor_units: i64,
    pub currency: crate::types::Currency,
    pub provider: PaymentProvider,
    pub protocol: Option<VpnProtocol>,
    pub email: Option<String>,
    pub country: Option<String>,
    pub description: String,
    pub is_subscription: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CreateIntentResult {
    pub payment_id: String,
    pub confirmation_url: String,
}

pub struct PaymentService {
    store: Store,
    providers: Arc<ProviderRegistry>,
    purchase_service: Arc<SubscriptionPurchaseService>,
    vpn_factory: Arc<DefaultVpnAdapterFactory>,
    notifier: Arc<Notifier>,
    timeout: Duration,
    check_interval: Duration,
}

impl PaymentService {
    pub fn new(
        store: Store,
        providers: Arc<ProviderRegistry>,
        purchase_service: Arc<SubscriptionPurchaseService>,
        vpn_factory: Arc<DefaultVpnAdapterFactory>,
        notifier: Arc<Notifier>,
    ) -> Self {
        PaymentService {
            store,
            providers,
            purchase_service,
            vpn_factory,
            notifier,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECONDS),
        }
    }

    pub fn with_poll_timing(mut self, timeout: Duration, check_interval: Duration) -> Self {
        self.timeout = timeout;
        self.check_interval = check_interval;
        self
    }

    /// Creates the provider-side payment first, then persists the local
    /// `pending` row keyed by the provider's own payment id — the id a
    /// webhook will later echo back.
    pub async fn create_intent(&self, req: CreateIntentRequest) -> Result<CreateIntentResult> {
        let adapter = self.providers.get(req.provider)?;
        let external_id = uuid::Uuid::new_v4().to_string();
        let create_req = CreatePaymentRequest {
            amount_minor_units: req.amount_minor_units,
            currency: req.currency.as_str().to_string(),
            description: req.description.clone(),
            email: req.email.clone(),
            external_id: external_id.clone(),
            metadata: serde_json::json!({ "external_id": external_id }),
        };
        let created = adapter.create_payment(&create_req).await?;

        let mut metadata: Metadata = Metadata::new();
        if req.is_subscription {
            metadata.insert(
                METADATA_KEY_TYPE.to_string(),
                serde_json::json!(METADATA_VALUE_SUBSCRIPTION),
            );
        } else {
            metadata.insert(METADATA_KEY_TYPE.to_string(), serde_json::json!("key"));
        }

        let now = chrono::Utc::now().timestamp();
        let payment = Payment {
            id: 0,
            payment_id: created.provider_payment_id.clone(),
            user_id: req.user_id,
            tariff_id: req.tariff_id,
            amount: req.amount_minor_units,
            currency: req.currency,
            email: req.email,
            status: PaymentStatus::Pending,
            country: req.country,
            protocol: req.protocol,
            provider: req.provider,
            method: None,
            description: Some(req.description),
            created_at: now,
            updated_at: now,
            paid_at: None,
            metadata,
            subscription_id: None,
        };
        self.store.payments.create(&payment).await?;

        Ok(CreateIntentResult {
            payment_id: created.provider_payment_id,
            confirmation_url: created.confirmation_url,
        })
    }

    /// Polls the provider for up to `self.timeout`, sleeping `self.check_interval`
    /// between attempts. Returns `true` if the provider confirms payment within
    /// the window; never mutates state itself on timeout (SPEC_FULL.md §5).
    pub async fn poll_until_paid(&self, payment_id: &str) -> Result<bool> {
        let Some(payment) = self.store.payments.get_by_payment_id(payment_id).await? else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(payment.status != PaymentStatus::Failed);
        }
        let adapter = self.providers.get(payment.provider)?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match adapter.check_payment(payment_id).await {
                Ok(true) => {
                    self.on_paid(payment_id).await;
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(payment_id, error = %e, "provider status poll failed, treating as not yet paid");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }

    /// Dispatches a confirmed-paid payment into the subscription purchase
    /// path or the simple one-off key issuance path. Never raises; failures
    /// are logged and left for the reconciler to retry.
    pub async fn on_paid(&self, payment_id: &str) {
        let payment = match self.store.payments.get_by_payment_id(payment_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(payment_id, "onPaid called for unknown payment");
                return;
            }
            Err(e) => {
                warn!(payment_id, error = %e, "store error in onPaid");
                return;
            }
        };

        if payment.is_subscription_payment() {
            let outcome = self.purchase_service.process(payment_id).await;
            if !outcome.ok {
                warn!(payment_id, message = ?outcome.message, "subscription purchase did not complete");
            }
            return;
        }

        match self.issue_simple_key(&payment).await {
            Ok(outcome) if !outcome.ok => {
                warn!(payment_id, message = ?outcome.message, "simple key issuance did not complete");
            }
            Err(e) => warn!(payment_id, error = %e, "simple key issuance failed"),
            _ => {}
        }
    }

    /// A non-subscription payment just wants one credential on one server of
    /// the requested protocol, with no subscription row linking it.
    async fn issue_simple_key(&self, payment: &Payment) -> Result<Outcome> {
        if payment.status == PaymentStatus::Completed {
            return Ok(Outcome::success_with("already completed"));
        }
        let Some(protocol) = payment.protocol else {
            return Ok(Outcome::failure("payment has no protocol, cannot issue a key"));
        };

        let servers = self.store.catalog.active_servers(protocol).await?;
        let Some(server) = servers.into_iter().min_by_key(|s| s.id) else {
            return Ok(Outcome::failure("no active server available for protocol"));
        };

        let label = format!("user-{}-pay-{}", payment.user_id, payment.payment_id);
        let adapter = self.vpn_factory.for_server(&server);
        let handle = adapter.create_user(&label).await?;

        match (&handle, protocol) {
            (CredentialHandle::V2ray { uuid }, VpnProtocol::V2ray) => {
                let client_config = adapter.get_user_config(&handle).await?.unwrap_or_default();
                let key = V2rayKey {
                    id: 0,
                    server_id: server.id,
                    user_id: payment.user_id,
                    v2ray_uuid: uuid.clone(),
                    email: label.clone(),
                    created_at: chrono::Utc::now().timestamp(),
                    tariff_id: payment.tariff_id,
                    client_config,
                    subscription_id: None,
                    traffic_limit_mb: 0,
                };
                self.store.keys.insert_v2ray_key(&key).await?;
            }
            (CredentialHandle::Outline { key_id, access_url }, VpnProtocol::Outline) => {
                let key = OutlineKey {
                    id: 0,
                    server_id: server.id,
                    user_id: payment.user_id,
                    access_url: access_url.clone(),
                    traffic_limit_mb: 0,
                    key_id: key_id.clone(),
                    created_at: chrono::Utc::now().timestamp(),
                    email: label.clone(),
                    tariff_id: payment.tariff_id,
                    subscription_id: None,
                };
                self.store.keys.insert_outline_key(&key).await?;
            }
            _ => {
                let _ = adapter.delete_user(&handle).await;
                return Err(PaymentCoreError::internal("adapter/protocol mismatch during simple key issuance"));
            }
        }

        self.store
            .payments
            .try_update_status(&payment.payment_id, PaymentStatus::Completed, PaymentStatus::Paid)
            .await?;

        if let Err(e) = self
            .notifier
            .notify_user(payment.user_id, "Your key is ready. Check the bot for connection details.")
            .await
        {
            warn!(payment_id = %payment.payment_id, error = %e, "simple-key notification failed");
        }

        info!(payment_id = %payment.payment_id, server_id = server.id, "simple key issued");
        Ok(Outcome::success())
    }

    /// Admin refund. Requires `status ∈ {paid, completed}` (SPEC_FULL.md §9
    /// open question decision); CAS-gated so a racing completion or a second
    /// refund call cannot double-refund.
    pub async fn refund(&self, payment_id: &str, reason: &str) -> Outcome {
        let payment = match self.store.payments.get_by_payment_id(payment_id).await {
            Ok(Some(p)) => p,
            Ok(None) => return Outcome::failure("payment not found"),
            Err(e) => return Outcome::failure(e.to_string()),
        };

        if !matches!(payment.status, PaymentStatus::Paid | PaymentStatus::Completed) {
            return Outcome::failure(format!(
                "payment is in status {:?}, refund requires paid or completed",
                payment.status
            ));
        }

        let adapter = match self.providers.get(payment.provider) {
            Ok(a) => a,
            Err(e) => return Outcome::failure(e.to_string()),
        };

        match adapter.refund_payment(payment_id, payment.amount, reason).await {
            Ok(true) => {}
            Ok(false) => return Outcome::failure("provider rejected the refund"),
            Err(e) => return Outcome::failure(e.to_string()),
        }

        let won = match self
            .store
            .payments
            .try_update_status(payment_id, PaymentStatus::Refunded, payment.status)
            .await
        {
            Ok(won) => won,
            Err(e) => return Outcome::failure(e.to_string()),
        };
        if !won {
            return Outcome::failure("payment status changed concurrently, refund not recorded locally");
        }

        info!(payment_id, reason, "payment refunded");
        Outcome::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::BotHandleTransport;
    use crate::providers::YooKassaAdapter;
    use crate::store::SqliteStore;
    use crate::types::*;
    use crate::vpn::DefaultVpnAdapterFactory;

    fn build_registry() -> Arc<ProviderRegistry> {
        let mut adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            PaymentProvider::Yookassa,
            Arc::new(YooKassaAdapter::new(
                "shop".to_string(),
                "".to_string(),
                Some("secret".to_string()),
                "https://return.example".to_string(),
            )),
        );
        Arc::new(ProviderRegistry::new(adapters))
    }

    async fn build_service() -> (PaymentService, Store) {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        sqlite.seed_server(&Server {
            id: 1,
            protocol: VpnProtocol::Outline,
            api_url: "https://outline-test.local".to_string(),
            api_key: None,
            country: None,
            active: true,
            access_level: AccessLevel::All,
        });
        let store = Store {
            payments: sqlite.clone(),
            subscriptions: sqlite.clone(),
            keys: sqlite.clone(),
            catalog: sqlite.clone(),
        };
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let notifier = Arc::new(Notifier::new(vec![Arc::new(BotHandleTransport::new(tx))], None));
        let vpn_factory = Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(5)));
        let purchase_service = Arc::new(SubscriptionPurchaseService::new(
            store.clone(),
            vpn_factory.clone(),
            notifier.clone(),
            "vpn.example".to_string(),
            None,
        ));
        let service = PaymentService::new(store.clone(), build_registry(), purchase_service, vpn_factory, notifier);
        (service, store)
    }

    #[tokio::test]
    async fn create_intent_persists_pending_payment_keyed_by_provider_id() {
        let (service, store) = build_service().await;
        let result = service
            .create_intent(CreateIntentRequest {
                user_id: 1,
                tariff_id: 7,
                amount_minor_units: 19_900,
                currency: Currency::Rub,
                provider: PaymentProvider::Yookassa,
                protocol: Some(VpnProtocol::V2ray),
                email: None,
                country: None,
                description: "monthly".to_string(),
                is_subscription: true,
            })
            .await
            .unwrap();

        assert!(result.payment_id.starts_with("fake-yookassa-"));
        let stored = store.payments.get_by_payment_id(&result.payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(stored.is_subscription_payment());
    }

    #[tokio::test]
    async fn simple_key_issuance_completes_non_subscription_payment() {
        let (service, store) = build_service().await;
        let now = chrono::Utc::now().timestamp();
        let payment = Payment {
            id: 0,
            payment_id: "pay_simple_1".to_string(),
            user_id: 9,
            tariff_id: 1,
            amount: 500,
            currency: Currency::Rub,
            email: None,
            status: PaymentStatus::Paid,
            country: None,
            protocol: Some(VpnProtocol::Outline),
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now,
            updated_at: now,
            paid_at: Some(now),
            metadata: Metadata::new(),
            subscription_id: None,
        };
        store.payments.create(&payment).await.unwrap();

        service.on_paid("pay_simple_1").await;

        let final_payment = store.payments.get_by_payment_id("pay_simple_1").await.unwrap().unwrap();
        assert_eq!(final_payment.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn refund_rejects_pending_payment() {
        let (service, store) = build_service().await;
        let now = chrono::Utc::now().timestamp();
        let payment = Payment {
            id: 0,
            payment_id: "pay_refund_1".to_string(),
            user_id: 2,
            tariff_id: 1,
            amount: 500,
            currency: Currency::Rub,
            email: None,
            status: PaymentStatus::Pending,
            country: None,
            protocol: Some(VpnProtocol::Outline),
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now,
            updated_at: now,
            paid_at: None,
            metadata: Metadata::new(),
            subscription_id: None,
        };
        store.payments.create(&payment).await.unwrap();

        let outcome = service.refund("pay_refund_1", "customer request").await;
        assert!(!outcome.ok);
    }
}
