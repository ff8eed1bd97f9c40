//! The purchase/renewal engine (SPEC_FULL.md §4.2). Turns a `paid` payment
//! marked as a subscription purchase into a subscription, a fanned-out set
//! of remote credentials, and exactly one user notification, then finalizes
//! the payment to `completed`. Designed to be safe under arbitrary retries:
//! webhook duplicates, reconciler re-runs, and crash-and-restart all
//! converge on the same end state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::notifier::Notifier;
use crate::store::Store;
use crate::types::{
    AccessLevel, OutlineKey, Outcome, Payment, PaymentStatus, Server, Subscription, Tariff,
    V2rayKey, VpnProtocol, MAX_EXPIRY_HORIZON_SECONDS, VIP_EXPIRES_AT,
};
use crate::vpn::{CredentialHandle, DefaultVpnAdapterFactory, VpnAdapter};

/// Staleness window for the per-payment processing lock (SPEC_FULL.md §4.1).
const PROCESSING_LOCK_STALENESS_SECONDS: i64 = 600;
const RENEWAL_MANUAL_OVERRIDE_HORIZON_SECONDS: i64 = 5 * 365 * 24 * 3600;
const REFERRAL_BONUS_SECONDS: i64 = 30 * 24 * 3600;

pub struct SubscriptionPurchaseService {
    store: Store,
    vpn_factory: Arc<DefaultVpnAdapterFactory>,
    notifier: Arc<Notifier>,
    public_host: String,
    primary_outline_server_id: Option<i64>,
}

impl SubscriptionPurchaseService {
    pub fn new(
        store: Store,
        vpn_factory: Arc<DefaultVpnAdapterFactory>,
        notifier: Arc<Notifier>,
        public_host: String,
        primary_outline_server_id: Option<i64>,
    ) -> Self {
        SubscriptionPurchaseService {
            store,
            vpn_factory,
            notifier,
            public_host,
            primary_outline_server_id,
        }
    }

    /// Never raises to the caller; every failure path leaves the store in a
    /// state from which a later retry can make progress. Guarded by the
    /// per-payment processing lock so concurrent webhook/reconciler callers
    /// cannot fan out credentials twice for the same payment.
    pub async fn process(&self, payment_id: &str) -> Outcome {
        match self.store.payments.get_by_payment_id(payment_id).await {
            Ok(Some(payment)) if payment.status == PaymentStatus::Completed => {
                return self
                    .handle_duplicate(&payment)
                    .await
                    .unwrap_or_else(|e| Outcome::failure(e.to_string()));
            }
            Ok(_) => {}
            Err(e) => return Outcome::failure(e.to_string()),
        }

        let lock_acquired = match self
            .store
            .payments
            .try_acquire_processing_lock(payment_id, PROCESSING_LOCK_STALENESS_SECONDS)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => return Outcome::failure(e.to_string()),
        };
        if !lock_acquired {
            return Outcome::failure("payment is already being processed, not found, or completed");
        }

        let result = self.process_inner(payment_id).await;

        if let Err(e) = self.store.payments.release_processing_lock(payment_id).await {
            warn!(payment_id, error = %e, "failed to release processing lock");
        }

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(payment_id, error = %e, "subscription purchase failed");
                Outcome::failure(e.to_string())
            }
        }
    }

    async fn process_inner(&self, payment_id: &str) -> crate::error::Result<Outcome> {
        let now = chrono::Utc::now().timestamp();

        // Step 1: load payment.
        let Some(mut payment) = self.store.payments.get_by_payment_id(payment_id).await? else {
            return Ok(Outcome::failure("payment not found"));
        };
        if payment.status == PaymentStatus::Completed {
            return self.handle_duplicate(&payment).await;
        }
        if payment.status != PaymentStatus::Paid {
            return Ok(Outcome::failure(format!(
                "payment is in status {:?}, expected paid",
                payment.status
            )));
        }
        if !payment.is_subscription_payment() {
            return Ok(Outcome::failure("payment is not a subscription payment"));
        }

        // Step 2: load tariff.
        let Some(tariff) = self.store.catalog.get_tariff(payment.tariff_id).await? else {
            return Ok(Outcome::failure("tariff not found"));
        };

        // Step 3: re-read payment status; it may have raced to completed
        // while we were loading the tariff.
        let Some(refreshed) = self.store.payments.get_by_payment_id(payment_id).await? else {
            return Ok(Outcome::failure("payment disappeared"));
        };
        payment = refreshed;
        if payment.status == PaymentStatus::Completed {
            return self.handle_duplicate(&payment).await;
        }

        // Step 4: retry-detection short circuit.
        let (subscription, was_created, recovery_path) = if let Some(sub_id) = payment.subscription_id {
            let keys_count = self.store.subscriptions.count_keys(sub_id).await?;
            if keys_count > 0 {
                self.finalize_already_provisioned(&payment, sub_id).await?;
                return Ok(Outcome::success());
            }
            let Some(sub) = self.store.subscriptions.get_by_id(sub_id).await? else {
                return Ok(Outcome::failure("linked subscription not found"));
            };
            (sub, false, true)
        } else {
            // Step 5: get or create subscription.
            let user = self.store.catalog.get_user(payment.user_id).await?;
            let is_vip_user = user.map(|u| u.is_vip).unwrap_or(false);
            let traffic_limit = if is_vip_user { 0 } else { tariff.traffic_limit_mb };
            let (sub, created) = self
                .store
                .subscriptions
                .get_or_create_active(payment.user_id, tariff.id, traffic_limit, now)
                .await?;
            (sub, created, false)
        };

        // Step 6: link payment to subscription.
        self.store
            .payments
            .update_subscription_id(payment_id, subscription.id)
            .await?;

        // Step 7: mark payment completed early.
        let completed_now = self
            .store
            .payments
            .try_update_status(payment_id, PaymentStatus::Completed, PaymentStatus::Paid)
            .await?;
        if !completed_now {
            // Someone else already finalized this payment concurrently.
            return self.handle_duplicate(&payment).await;
        }

        // Step 8 + 9: VIP detection and expiry computation.
        let user_is_vip = self
            .store
            .catalog
            .get_user(payment.user_id)
            .await?
            .map(|u| u.is_vip)
            .unwrap_or(false);
        let is_vip = user_is_vip || subscription.is_vip();

        let new_expires_at = if is_vip {
            VIP_EXPIRES_AT
        } else if was_created {
            self.compute_fresh_expiry(&subscription, &tariff, now).await?
        } else {
            self.compute_renewal_expiry(&subscription, &tariff, now)
        };

        // Step 10: apply expiry + traffic limit.
        let new_traffic_limit = if is_vip {
            0
        } else {
            compute_traffic_limit(subscription.traffic_limit_mb, tariff.traffic_limit_mb)
        };
        let updated_subscription = self
            .store
            .subscriptions
            .set_expiry_and_traffic_limit(subscription.id, new_expires_at, new_traffic_limit, tariff.id)
            .await?;

        // Step 11: reset traffic counters only on a genuine extension.
        let genuinely_extended = !was_created && new_expires_at > subscription.expires_at;
        if genuinely_extended {
            if let Err(e) = self.reset_traffic_counters(&updated_subscription).await {
                warn!(subscription_id = subscription.id, error = %e, "traffic counter reset failed");
            }
        }

        // Step 12: provision keys if none exist yet.
        let existing_key_count = self.store.subscriptions.count_keys(subscription.id).await?;
        let mut any_key_created = existing_key_count > 0;
        if existing_key_count == 0 {
            any_key_created = self
                .provision_credentials(&updated_subscription, &tariff, is_vip, payment.user_id)
                .await?;
        }

        if !any_key_created {
            warn!(
                subscription_id = subscription.id,
                payment_id, "no credentials were provisioned for a completed payment"
            );
        }

        // Step 13: user notification.
        let subscription_url = format!(
            "https://{}/api/subscription/{}",
            self.public_host, updated_subscription.subscription_token
        );
        let first_purchase = was_created
            && self
                .store
                .subscriptions
                .earliest_completed_payment_created_at(subscription.id)
                .await?
                == Some(payment.created_at);

        let message = if was_created {
            format!(
                "Your subscription is ready: {subscription_url}\nValid until {}.",
                format_timestamp(new_expires_at)
            )
        } else {
            format!(
                "Your subscription has been extended: {subscription_url}\nNow valid until {}.",
                format_timestamp(new_expires_at)
            )
        };

        let notified = match self.notifier.notify_user(payment.user_id, &message).await {
            Ok(()) => true,
            Err(e) if !was_created => {
                // Renewal notifications must not be silently dropped: fail so
                // the reconciler retries.
                return Err(e);
            }
            Err(e) => {
                warn!(payment_id, error = %e, "purchase notification failed, deferring to reconciler");
                false
            }
        };

        if notified && was_created && first_purchase {
            let (outline_keys, _) = self.store.keys.keys_for_subscription(subscription.id).await?;
            if !outline_keys.is_empty() {
                let backup_list = outline_keys
                    .iter()
                    .map(|k| k.access_url.clone())
                    .collect::<Vec<_>>()
                    .join("\n");
                let _ = self
                    .notifier
                    .notify_user(payment.user_id, &format!("Backup credentials:\n{backup_list}"))
                    .await;
            }
        }

        // Step 14: flip purchase_notification_sent exactly once, and only once
        // the user has actually been notified — otherwise the flag would
        // permanently suppress the reconciler's retry.
        if notified {
            self.store
                .subscriptions
                .try_mark_purchase_notified(subscription.id)
                .await?;
        }

        // Step 15: best-effort admin notification.
        self.notifier
            .notify_admin(&format!(
                "Payment {payment_id} completed for user {}: subscription {} now expires {}",
                payment.user_id,
                updated_subscription.id,
                format_timestamp(new_expires_at)
            ))
            .await;

        // Step 16: consistency audit.
        self.audit_consistency(payment_id, subscription.id).await;

        let _ = recovery_path; // recovery differs only in how `subscription` was obtained.
        Ok(Outcome::success())
    }

    async fn handle_duplicate(&self, payment: &Payment) -> crate::error::Result<Outcome> {
        info!(payment_id = %payment.payment_id, "duplicate purchase webhook for already-completed payment");
        self.notifier
            .notify_admin(&format!(
                "Duplicate completion webhook observed for payment {}",
                payment.payment_id
            ))
            .await;
        Ok(Outcome::success())
    }

    async fn finalize_already_provisioned(
        &self,
        payment: &Payment,
        _subscription_id: i64,
    ) -> crate::error::Result<()> {
        self.store
            .payments
            .try_update_status(&payment.payment_id, PaymentStatus::Completed, PaymentStatus::Paid)
            .await?;
        self.notifier
            .notify_admin(&format!(
                "Duplicate webhook after full provisioning for payment {}",
                payment.payment_id
            ))
            .await;
        Ok(())
    }

    async fn compute_fresh_expiry(
        &self,
        subscription: &Subscription,
        tariff: &Tariff,
        now: i64,
    ) -> crate::error::Result<i64> {
        let earliest = self
            .store
            .subscriptions
            .earliest_completed_payment_created_at(subscription.id)
            .await?
            .unwrap_or(subscription.created_at);
        let base = earliest.max(subscription.created_at);

        let mut total_duration = self
            .store
            .subscriptions
            .sum_completed_tariff_duration(subscription.id)
            .await?;
        if total_duration <= 0 {
            total_duration = tariff.duration_sec;
        }

        let preliminary_expiry = base + total_duration;
        let referral_count = self
            .store
            .catalog
            .eligible_referral_count(subscription.user_id, preliminary_expiry)
            .await?;
        let bonus = referral_count.max(0) * REFERRAL_BONUS_SECONDS;

        let expiry = base + total_duration + bonus;
        Ok(expiry.min(now + MAX_EXPIRY_HORIZON_SECONDS))
    }

    fn compute_renewal_expiry(&self, subscription: &Subscription, tariff: &Tariff, now: i64) -> i64 {
        if subscription.expires_at >= VIP_EXPIRES_AT
            || (subscription.expires_at - now) > RENEWAL_MANUAL_OVERRIDE_HORIZON_SECONDS
        {
            // Manual-override guard: don't extend a far-future or VIP expiry.
            return subscription.expires_at;
        }
        subscription.expires_at + tariff.duration_sec
    }

    async fn reset_traffic_counters(&self, subscription: &Subscription) -> crate::error::Result<()> {
        self.store.keys.reset_traffic_counters(subscription.id).await?;
        let (outline_keys, v2ray_keys) = self.store.keys.keys_for_subscription(subscription.id).await?;
        for key in outline_keys {
            let server = match self.store.catalog.active_servers(VpnProtocol::Outline).await {
                Ok(servers) => servers.into_iter().find(|s| s.id == key.server_id),
                Err(_) => None,
            };
            if let Some(server) = server {
                let adapter = self.vpn_factory.for_server(&server);
                let handle = CredentialHandle::Outline {
                    key_id: key.key_id.clone(),
                    access_url: key.access_url.clone(),
                };
                let _ = adapter.reset_traffic(&handle).await;
            }
        }
        for key in v2ray_keys {
            let server = match self.store.catalog.active_servers(VpnProtocol::V2ray).await {
                Ok(servers) => servers.into_iter().find(|s| s.id == key.server_id),
                Err(_) => None,
            };
            if let Some(server) = server {
                let adapter = self.vpn_factory.for_server(&server);
                let handle = CredentialHandle::V2ray {
                    uuid: key.v2ray_uuid.clone(),
                };
                let _ = adapter.reset_traffic(&handle).await;
            }
        }
        Ok(())
    }

    /// Credential fan-out (SPEC_FULL.md §4.2.4). Returns whether at least
    /// one key was created.
    async fn provision_credentials(
        &self,
        subscription: &Subscription,
        tariff: &Tariff,
        is_vip: bool,
        user_id: i64,
    ) -> crate::error::Result<bool> {
        let _ = tariff;
        let v2ray_servers = self.eligible_servers(VpnProtocol::V2ray, is_vip).await?;
        let outline_server = self.select_outline_server(is_vip).await?;

        let label = format!("user-{}-sub-{}", user_id, subscription.id);

        let v2ray_futures = v2ray_servers.into_iter().map(|server| {
            let label = label.clone();
            async move { self.provision_v2ray(&server, subscription, user_id, &label).await }
        });
        let v2ray_results = join_all(v2ray_futures).await;
        let mut any_created = v2ray_results.iter().any(|r| matches!(r, Ok(true)));
        for result in v2ray_results {
            if let Err(e) = result {
                warn!(subscription_id = subscription.id, error = %e, "v2ray provisioning failed for one server");
            }
        }

        if let Some(server) = outline_server {
            match self.provision_outline(&server, subscription, user_id, &label).await {
                Ok(created) => any_created = any_created || created,
                Err(e) => warn!(subscription_id = subscription.id, error = %e, "outline provisioning failed"),
            }
        }

        Ok(any_created)
    }

    async fn eligible_servers(&self, protocol: VpnProtocol, is_vip: bool) -> crate::error::Result<Vec<Server>> {
        let all = self.store.catalog.active_servers(protocol).await?;
        Ok(all
            .into_iter()
            .filter(|s| server_access_ok(s.access_level, is_vip))
            .collect())
    }

    /// Picks at most one outline server: the configured primary if active,
    /// otherwise the lowest-id active server (open question #1 in
    /// SPEC_FULL.md §9).
    async fn select_outline_server(&self, is_vip: bool) -> crate::error::Result<Option<Server>> {
        let mut servers = self.eligible_servers(VpnProtocol::Outline, is_vip).await?;
        servers.sort_by_key(|s| s.id);
        if let Some(primary_id) = self.primary_outline_server_id {
            if let Some(pos) = servers.iter().position(|s| s.id == primary_id) {
                let primary = servers.remove(pos);
                return Ok(Some(primary));
            }
        }
        Ok(servers.into_iter().next())
    }

    async fn provision_v2ray(
        &self,
        server: &Server,
        subscription: &Subscription,
        user_id: i64,
        label: &str,
    ) -> crate::error::Result<bool> {
        if self.store.keys.get_v2ray_key(server.id, subscription.id).await?.is_some() {
            return Ok(false);
        }
        let adapter = self.vpn_factory.for_server(server);
        let handle = adapter.create_user(label).await?;
        let CredentialHandle::V2ray { uuid } = handle.clone() else {
            return Err(crate::error::PaymentCoreError::vpn(
                "v2ray",
                server.id,
                "adapter returned a non-v2ray handle",
            ));
        };
        let client_config = adapter
            .get_user_config(&handle)
            .await?
            .unwrap_or_default();

        let key = V2rayKey {
            id: 0,
            server_id: server.id,
            user_id,
            v2ray_uuid: uuid,
            email: label.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            tariff_id: subscription.tariff_id,
            client_config,
            subscription_id: Some(subscription.id),
            traffic_limit_mb: subscription.traffic_limit_mb,
        };

        match self.store.keys.insert_v2ray_key(&key).await {
            Ok(_) => Ok(true),
            Err(e) => {
                // Race lost, or a genuine consistency problem: clean up the
                // remote user either way.
                let _ = adapter.delete_user(&handle).await;
                if matches!(e, crate::error::PaymentCoreError::Consistency(_)) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn provision_outline(
        &self,
        server: &Server,
        subscription: &Subscription,
        user_id: i64,
        label: &str,
    ) -> crate::error::Result<bool> {
        if self.store.keys.get_outline_key(server.id, subscription.id).await?.is_some() {
            return Ok(false);
        }
        let adapter = self.vpn_factory.for_server(server);
        let handle = adapter.create_user(label).await?;
        let CredentialHandle::Outline { key_id, access_url } = handle.clone() else {
            return Err(crate::error::PaymentCoreError::vpn(
                "outline",
                server.id,
                "adapter returned a non-outline handle",
            ));
        };

        let key = OutlineKey {
            id: 0,
            server_id: server.id,
            user_id,
            access_url,
            traffic_limit_mb: subscription.traffic_limit_mb,
            key_id,
            created_at: chrono::Utc::now().timestamp(),
            email: label.to_string(),
            tariff_id: subscription.tariff_id,
            subscription_id: Some(subscription.id),
        };

        match self.store.keys.insert_outline_key(&key).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let _ = adapter.delete_user(&handle).await;
                if matches!(e, crate::error::PaymentCoreError::Consistency(_)) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn audit_consistency(&self, payment_id: &str, subscription_id: i64) {
        let Ok(keys) = self.store.subscriptions.count_keys(subscription_id).await else {
            return;
        };
        if keys == 0 {
            warn!(payment_id, subscription_id, "consistency audit: subscription has no keys");
        }
        if let Ok(Some(payment)) = self.store.payments.get_by_payment_id(payment_id).await {
            if payment.status != PaymentStatus::Completed {
                warn!(payment_id, "consistency audit: payment is not completed after processing");
            }
        }
        if let Ok(Some(sub)) = self.store.subscriptions.get_by_id(subscription_id).await {
            if !sub.purchase_notification_sent {
                warn!(payment_id, subscription_id, "consistency audit: purchase_notification_sent not set");
            }
        }
    }
}

fn server_access_ok(level: AccessLevel, is_vip: bool) -> bool {
    match level {
        AccessLevel::All => true,
        AccessLevel::Vip => is_vip,
        // The caller only reaches this point for payments that are about to
        // be (or already are) paid subscriptions, so "paid" access is
        // implied for the subscription currently being provisioned.
        AccessLevel::Paid => true,
    }
}

/// SPEC_FULL.md §4.2.3 traffic-limit preservation invariant.
fn compute_traffic_limit(current: i64, tariff_limit: i64) -> i64 {
    if current == 0 {
        0
    } else if current > tariff_limit && tariff_limit > 0 {
        current
    } else {
        tariff_limit
    }
}

fn format_timestamp(epoch_seconds: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(epoch_seconds, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| epoch_seconds.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BotHandleTransport, Notifier};
    use crate::store::SqliteStore;
    use crate::types::*;
    use std::sync::Arc;

    fn sample_payment(payment_id: &str, user_id: i64, tariff_id: i64, now: i64) -> Payment {
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_KEY_TYPE.to_string(), serde_json::json!("subscription"));
        Payment {
            id: 0,
            payment_id: payment_id.to_string(),
            user_id,
            tariff_id,
            amount: 19_900,
            currency: Currency::Rub,
            email: Some("user@example.com".to_string()),
            status: PaymentStatus::Paid,
            country: None,
            protocol: Some(VpnProtocol::V2ray),
            provider: PaymentProvider::Yookassa,
            method: None,
            description: None,
            created_at: now,
            updated_at: now,
            paid_at: Some(now),
            metadata,
            subscription_id: None,
        }
    }

    fn seed_catalog(sqlite: &SqliteStore) {
        sqlite.seed_tariff(&Tariff {
            id: 7,
            name: "monthly".to_string(),
            duration_sec: 2_592_000,
            price_minor_units: 19_900,
            currency: Currency::Rub,
            traffic_limit_mb: 50_000,
            is_vip: false,
        });
        for id in 1..=3 {
            sqlite.seed_server(&Server {
                id,
                protocol: VpnProtocol::V2ray,
                api_url: "https://v2ray-test.local".to_string(),
                api_key: None,
                country: None,
                active: true,
                access_level: AccessLevel::All,
            });
        }
        sqlite.seed_server(&Server {
            id: 100,
            protocol: VpnProtocol::Outline,
            api_url: "https://outline-test.local".to_string(),
            api_key: None,
            country: None,
            active: true,
            access_level: AccessLevel::All,
        });
    }

    #[tokio::test]
    async fn simple_purchase_creates_subscription_and_completes_payment() {
        let now = 1_700_000_000;
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_catalog(&sqlite);
        let store = Store {
            payments: sqlite.clone(),
            subscriptions: sqlite.clone(),
            keys: sqlite.clone(),
            catalog: sqlite.clone(),
        };
        let (tx, mut rx2) = tokio::sync::mpsc::channel(16);
        let notifier = Arc::new(Notifier::new(vec![Arc::new(BotHandleTransport::new(tx))], None));
        let service = SubscriptionPurchaseService::new(
            store.clone(),
            Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(5))),
            notifier,
            "vpn.example".to_string(),
            Some(100),
        );

        let payment = sample_payment("pay_s1", 42, 7, now);
        store.payments.create(&payment).await.unwrap();

        let outcome = service.process("pay_s1").await;
        assert!(outcome.ok, "expected success, got {:?}", outcome.message);

        let completed = store.payments.get_by_payment_id("pay_s1").await.unwrap().unwrap();
        assert_eq!(completed.status, PaymentStatus::Completed);
        assert!(completed.subscription_id.is_some());

        let sub = store
            .subscriptions
            .get_by_id(completed.subscription_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!((sub.expires_at - (now + 2_592_000)).abs() <= 60);
        assert!(sub.purchase_notification_sent);

        let (outline_keys, v2ray_keys) = store.keys.keys_for_subscription(sub.id).await.unwrap();
        assert_eq!(v2ray_keys.len(), 3);
        assert_eq!(outline_keys.len(), 1);

        // Exactly one purchase notification.
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn concurrent_duplicate_webhook_creates_exactly_one_key_set() {
        let now = 1_700_000_000;
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_catalog(&sqlite);
        let store = Store {
            payments: sqlite.clone(),
            subscriptions: sqlite.clone(),
            keys: sqlite.clone(),
            catalog: sqlite.clone(),
        };
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let notifier = Arc::new(Notifier::new(vec![Arc::new(BotHandleTransport::new(tx))], None));
        let service = Arc::new(SubscriptionPurchaseService::new(
            store.clone(),
            Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(5))),
            notifier,
            "vpn.example".to_string(),
            Some(100),
        ));

        let payment = sample_payment("pay_s2", 43, 7, now);
        store.payments.create(&payment).await.unwrap();

        let (a, b) = tokio::join!(service.process("pay_s2"), service.process("pay_s2"));
        assert!(a.ok || b.ok);

        let completed = store.payments.get_by_payment_id("pay_s2").await.unwrap().unwrap();
        assert_eq!(completed.status, PaymentStatus::Completed);
        let sub_id = completed.subscription_id.unwrap();
        let (outline_keys, v2ray_keys) = store.keys.keys_for_subscription(sub_id).await.unwrap();
        assert_eq!(v2ray_keys.len(), 3);
        assert_eq!(outline_keys.len(), 1);

        // The winning processor sends the purchase message plus, since this
        // is the subscription's first payment, one backup-credentials
        // message. The loser never reaches notification at all.
        let mut notifications = 0;
        while rx.try_recv().is_ok() {
            notifications += 1;
        }
        assert_eq!(notifications, 2, "purchase + backup-credentials message expected exactly once");
    }

    #[test]
    fn traffic_limit_preserves_higher_existing_bonus() {
        assert_eq!(compute_traffic_limit(50_000, 10_000), 50_000);
        assert_eq!(compute_traffic_limit(0, 10_000), 0);
        assert_eq!(compute_traffic_limit(5_000, 10_000), 10_000);
    }

    #[test]
    fn server_access_filters_vip_only_servers() {
        assert!(server_access_ok(AccessLevel::All, false));
        assert!(!server_access_ok(AccessLevel::Vip, false));
        assert!(server_access_ok(AccessLevel::Vip, true));
        assert!(server_access_ok(AccessLevel::Paid, false));
    }
}
