//! Periodic convergence sweeps plus an on-demand admin trigger
//! (SPEC_FULL.md §4.5). Runs as a background task alongside the HTTP server;
//! every sweep step is individually fallible and logged rather than fatal —
//! one bad row must never stop the loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::providers::ProviderAdapter;
use crate::renewal_detector::RenewalDetector;
use crate::store::Store;
use crate::types::{OutlineKey, PaymentStatus, V2rayKey, VpnProtocol};
use crate::vpn::{CredentialHandle, DefaultVpnAdapterFactory};

use super::payment_service::ProviderRegistry;
use super::SubscriptionPurchaseService;

const V2RAY_PACING: Duration = Duration::from_secs(15);
const OTHER_PACING: Duration = Duration::from_secs(2);
const DEFAULT_CLEANUP_EXPIRED_HOURS: i64 = 24;

pub struct Reconciler {
    store: Store,
    providers: Arc<ProviderRegistry>,
    purchase_service: Arc<SubscriptionPurchaseService>,
    vpn_factory: Arc<DefaultVpnAdapterFactory>,
    renewal_detector: RenewalDetector,
    cleanup_expired_hours: i64,
}

impl Reconciler {
    pub fn new(
        store: Store,
        providers: Arc<ProviderRegistry>,
        purchase_service: Arc<SubscriptionPurchaseService>,
        vpn_factory: Arc<DefaultVpnAdapterFactory>,
    ) -> Self {
        let renewal_detector = RenewalDetector::new(store.keys.clone());
        Reconciler {
            store,
            providers,
            purchase_service,
            vpn_factory,
            renewal_detector,
            cleanup_expired_hours: DEFAULT_CLEANUP_EXPIRED_HOURS,
        }
    }

    pub fn with_cleanup_expired_hours(mut self, hours: i64) -> Self {
        self.cleanup_expired_hours = hours;
        self
    }

    /// Spawns the periodic sweep loop. The returned handle may be dropped to
    /// abort it; callers normally keep it alive for the process lifetime.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// Runs every sweep exactly once. Used both by the background loop and by
    /// the on-demand admin `/admin/reconcile` endpoint.
    pub async fn run_once(&self) {
        info!("reconciliation sweep starting");
        if let Err(e) = self.sweep_pending().await {
            warn!(error = %e, "pending sweep failed");
        }
        if let Err(e) = self.sweep_paid_without_keys().await {
            warn!(error = %e, "paid-without-key sweep failed");
        }
        if let Err(e) = self.sweep_expired().await {
            warn!(error = %e, "expiration sweep failed");
        }
        info!("reconciliation sweep complete");
    }

    async fn sweep_pending(&self) -> crate::error::Result<()> {
        let pending = self.store.payments.get_pending_payments().await?;
        for payment in pending {
            let adapter = match self.providers.get(payment.provider) {
                Ok(a) => a,
                Err(e) => {
                    warn!(payment_id = %payment.payment_id, error = %e, "no adapter for provider during pending sweep");
                    continue;
                }
            };
            let paid = match adapter.check_payment(&payment.payment_id).await {
                Ok(paid) => paid,
                Err(e) => {
                    // Provider forgetting an old record is treated as paid
                    // (§7 tolerance policy); any other error just defers.
                    warn!(payment_id = %payment.payment_id, error = %e, "pending sweep check_payment failed");
                    continue;
                }
            };
            if !paid {
                continue;
            }
            let won = self
                .store
                .payments
                .try_update_status(&payment.payment_id, PaymentStatus::Paid, PaymentStatus::Pending)
                .await?;
            if won {
                self.run_paid_pipeline(&payment.payment_id).await;
            }
        }
        Ok(())
    }

    async fn sweep_paid_without_keys(&self) -> crate::error::Result<()> {
        let payments = self.store.payments.get_paid_payments_without_keys().await?;
        for payment in payments {
            let pacing = if payment.protocol == Some(VpnProtocol::V2ray) {
                V2RAY_PACING
            } else {
                OTHER_PACING
            };
            tokio::time::sleep(pacing).await;

            if payment.is_subscription_payment() {
                let outcome = self.purchase_service.process(&payment.payment_id).await;
                if !outcome.ok {
                    warn!(payment_id = %payment.payment_id, message = ?outcome.message, "reconciler: subscription provisioning retry failed");
                }
                continue;
            }

            let now = chrono::Utc::now().timestamp();
            let protocol = match payment.protocol {
                Some(p) => p,
                None => continue,
            };
            let is_renewal = match self.renewal_detector.is_renewal(payment.user_id, protocol, now).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(payment_id = %payment.payment_id, error = %e, "renewal detection failed");
                    continue;
                }
            };
            if is_renewal {
                info!(payment_id = %payment.payment_id, "reconciler: treating as renewal, no new key issued");
                if let Err(e) = self
                    .store
                    .payments
                    .try_update_status(&payment.payment_id, PaymentStatus::Completed, PaymentStatus::Paid)
                    .await
                {
                    warn!(payment_id = %payment.payment_id, error = %e, "failed to finalize renewal payment");
                }
                continue;
            }
            if let Err(e) = self.issue_key_for_reconciled_payment(&payment.payment_id, protocol, payment.user_id, payment.tariff_id).await {
                warn!(payment_id = %payment.payment_id, error = %e, "reconciler: key issuance retry failed");
            }
        }
        Ok(())
    }

    async fn issue_key_for_reconciled_payment(
        &self,
        payment_id: &str,
        protocol: VpnProtocol,
        user_id: i64,
        tariff_id: i64,
    ) -> crate::error::Result<()> {
        let servers = self.store.catalog.active_servers(protocol).await?;
        let Some(server) = servers.into_iter().min_by_key(|s| s.id) else {
            return Err(crate::error::PaymentCoreError::not_found("no active server for protocol"));
        };
        let label = format!("user-{user_id}-pay-{payment_id}-reconciled");
        let adapter = self.vpn_factory.for_server(&server);
        let handle = adapter.create_user(&label).await?;

        match (&handle, protocol) {
            (CredentialHandle::V2ray { uuid }, VpnProtocol::V2ray) => {
                let client_config = adapter.get_user_config(&handle).await?.unwrap_or_default();
                self.store
                    .keys
                    .insert_v2ray_key(&V2rayKey {
                        id: 0,
                        server_id: server.id,
                        user_id,
                        v2ray_uuid: uuid.clone(),
                        email: label.clone(),
                        created_at: chrono::Utc::now().timestamp(),
                        tariff_id,
                        client_config,
                        subscription_id: None,
                        traffic_limit_mb: 0,
                    })
                    .await?;
            }
            (CredentialHandle::Outline { key_id, access_url }, VpnProtocol::Outline) => {
                self.store
                    .keys
                    .insert_outline_key(&OutlineKey {
                        id: 0,
                        server_id: server.id,
                        user_id,
                        access_url: access_url.clone(),
                        traffic_limit_mb: 0,
                        key_id: key_id.clone(),
                        created_at: chrono::Utc::now().timestamp(),
                        email: label.clone(),
                        tariff_id,
                        subscription_id: None,
                    })
                    .await?;
            }
            _ => {
                let _ = adapter.delete_user(&handle).await;
                return Err(crate::error::PaymentCoreError::internal("adapter/protocol mismatch in reconciler"));
            }
        }

        self.store
            .payments
            .try_update_status(payment_id, PaymentStatus::Completed, PaymentStatus::Paid)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> crate::error::Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - self.cleanup_expired_hours * 3600;
        let pending = self.store.payments.get_pending_payments().await?;
        for payment in pending {
            if payment.created_at < cutoff {
                self.store
                    .payments
                    .try_update_status(&payment.payment_id, PaymentStatus::Expired, PaymentStatus::Pending)
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_paid_pipeline(&self, payment_id: &str) {
        let Ok(Some(payment)) = self.store.payments.get_by_payment_id(payment_id).await else {
            return;
        };
        if payment.is_subscription_payment() {
            let outcome = self.purchase_service.process(payment_id).await;
            if !outcome.ok {
                warn!(payment_id, message = ?outcome.message, "reconciler: subscription purchase failed after pending sweep");
            }
        }
        // Non-subscription payments are left `paid`; sweep_paid_without_keys
        // picks them up on the next run with its own pacing.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BotHandleTransport, Notifier};
    use crate::providers::YooKassaAdapter;
    use crate::store::SqliteStore;
    use crate::types::*;
    use std::collections::HashMap;

    async fn build() -> (Arc<Reconciler>, Store) {
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
        let purchase_service = Arc::new(SubscriptionPurchaseService::new(
            store.clone(),
            vpn_factory.clone(),
            notifier,
            "vpn.example".to_string(),
            None,
        ));
        let mut adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            PaymentProvider::Yookassa,
            Arc::new(YooKassaAdapter::new(
                "shop".to_string(),
                "".to_string(),
                None,
                "https://return.example".to_string(),
            )),
        );
        let registry = Arc::new(ProviderRegistry::new(adapters));
        let reconciler = Arc::new(Reconciler::new(store.clone(), registry, purchase_service, vpn_factory));
        (reconciler, store)
    }

    #[tokio::test]
    async fn expiration_sweep_expires_old_pending_payments() {
        let (reconciler, store) = build().await;
        let now = chrono::Utc::now().timestamp();
        let old_payment = Payment {
            id: 0,
            payment_id: "pay_old".to_string(),
            user_id: 1,
            tariff_id: 1,
            amount: 100,
            currency: Currency::Rub,
            email: None,
            status: PaymentStatus::Pending,
            country: None,
            protocol: None,
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now - 48 * 3600,
            updated_at: now - 48 * 3600,
            paid_at: None,
            metadata: Metadata::new(),
            subscription_id: None,
        };
        store.payments.create(&old_payment).await.unwrap();

        reconciler.run_once().await;

        let after = store.payments.get_by_payment_id("pay_old").await.unwrap().unwrap();
        assert_eq!(after.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn pending_sweep_advances_fake_provider_payment_to_completed() {
        let (reconciler, store) = build().await;
        let now = chrono::Utc::now().timestamp();
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_KEY_TYPE.to_string(), serde_json::json!("key"));
        let payment = Payment {
            id: 0,
            payment_id: "pay_fake_1".to_string(),
            user_id: 1,
            tariff_id: 1,
            amount: 100,
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
            metadata,
            subscription_id: None,
        };
        store.payments.create(&payment).await.unwrap();
        store.catalog.get_tariff(1).await.ok();

        reconciler.run_once().await;

        let after = store.payments.get_by_payment_id("pay_fake_1").await.unwrap().unwrap();
        assert_ne!(after.status, PaymentStatus::Pending);
    }
}
