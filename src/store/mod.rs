//! Persistence traits: `PaymentRepo` and `SubscriptionRepo` plus their
//! atomic primitives (compare-and-set status, processing lock, extend-by-
//! duration). `SqliteStore` is the only implementation shipped here, but the
//! traits are written so an in-memory fake can back the unit tests.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::{
    OutlineKey, Payment, PaymentFilter, PaymentStatistics, PaymentStatus, Referral, Server,
    Subscription, Tariff, User, V2rayKey, VpnProtocol,
};
use async_trait::async_trait;

/// Typed CRUD plus the atomic primitives required by the payment state
/// machine (SPEC_FULL.md §4.1).
#[async_trait]
pub trait PaymentRepo: Send + Sync {
    async fn create(&self, payment: &Payment) -> Result<Payment>;
    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<Payment>>;
    async fn get_by_id(&self, id: i64) -> Result<Option<Payment>>;
    async fn update(&self, payment: &Payment) -> Result<()>;

    /// Conditional status transition; succeeds only if the current status
    /// equals `expected_from`. Retried internally on transient storage
    /// errors. Returns whether this caller won the race.
    async fn try_update_status(
        &self,
        payment_id: &str,
        to: PaymentStatus,
        expected_from: PaymentStatus,
    ) -> Result<bool>;

    /// Acquire the subscription-processing lock for `payment_id`. Rejects if
    /// the payment is already `completed`, or if the lock is held and not yet
    /// stale (see `staleness_seconds`).
    async fn try_acquire_processing_lock(
        &self,
        payment_id: &str,
        staleness_seconds: i64,
    ) -> Result<bool>;

    async fn release_processing_lock(&self, payment_id: &str) -> Result<()>;

    async fn update_subscription_id(&self, payment_id: &str, subscription_id: i64) -> Result<()>;

    /// Flip an arbitrary boolean-ish metadata flag 0->1 exactly once,
    /// returning whether this call performed the flip.
    async fn try_set_metadata_flag(&self, payment_id: &str, key: &str) -> Result<bool>;

    async fn filter(
        &self,
        filter: &PaymentFilter,
        sort_by: crate::types::SortBy,
        sort_order: crate::types::SortOrder,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Payment>>;

    async fn count_filtered(&self, filter: &PaymentFilter) -> Result<i64>;

    /// Feed for the reconciler's paid-without-key sweep.
    async fn get_paid_payments_without_keys(&self) -> Result<Vec<Payment>>;

    /// Feed for the reconciler's pending sweep.
    async fn get_pending_payments(&self) -> Result<Vec<Payment>>;

    async fn get_statistics(&self) -> Result<PaymentStatistics>;
}

/// Subscription row CRUD plus the atomic extend-by-duration primitive.
#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<Subscription>>;
    async fn get_active_for_user(&self, user_id: i64, now: i64) -> Result<Option<Subscription>>;

    /// Insert under a `BEGIN IMMEDIATE` transaction, re-checking for an
    /// active subscription first so concurrent callers converge on the same
    /// row (SPEC_FULL.md §4.2.2 step 5).
    async fn get_or_create_active(
        &self,
        user_id: i64,
        tariff_id: i64,
        traffic_limit_mb: i64,
        now: i64,
    ) -> Result<(Subscription, bool)>;

    /// Apply a new `expires_at` and `traffic_limit_mb` atomically. Returns
    /// the updated row.
    async fn set_expiry_and_traffic_limit(
        &self,
        subscription_id: i64,
        expires_at: i64,
        traffic_limit_mb: i64,
        tariff_id: i64,
    ) -> Result<Subscription>;

    /// Flip `purchase_notification_sent` 0->1; returns whether this call won.
    async fn try_mark_purchase_notified(&self, subscription_id: i64) -> Result<bool>;

    async fn count_keys(&self, subscription_id: i64) -> Result<i64>;

    async fn sum_completed_tariff_duration(&self, subscription_id: i64) -> Result<i64>;

    async fn earliest_completed_payment_created_at(
        &self,
        subscription_id: i64,
    ) -> Result<Option<i64>>;
}

/// Key (credential) persistence across both protocols.
#[async_trait]
pub trait KeyRepo: Send + Sync {
    async fn get_outline_key(
        &self,
        server_id: i64,
        subscription_id: i64,
    ) -> Result<Option<OutlineKey>>;
    async fn insert_outline_key(&self, key: &OutlineKey) -> Result<OutlineKey>;

    async fn get_v2ray_key(&self, server_id: i64, subscription_id: i64) -> Result<Option<V2rayKey>>;
    async fn insert_v2ray_key(&self, key: &V2rayKey) -> Result<V2rayKey>;

    async fn keys_for_subscription(
        &self,
        subscription_id: i64,
    ) -> Result<(Vec<OutlineKey>, Vec<V2rayKey>)>;

    /// Reset remote traffic counters is a VPN-adapter concern; this just
    /// clears any locally cached counter rows, if the schema keeps one.
    async fn reset_traffic_counters(&self, subscription_id: i64) -> Result<()>;

    /// Does the user hold a credential of `protocol` through a subscription
    /// that is still active right now? Backs `RenewalDetector`.
    async fn has_active_credential(
        &self,
        user_id: i64,
        protocol: VpnProtocol,
        now: i64,
    ) -> Result<bool>;
}

/// Read-only catalog accessors.
#[async_trait]
pub trait CatalogRepo: Send + Sync {
    async fn get_tariff(&self, id: i64) -> Result<Option<Tariff>>;
    async fn get_user(&self, id: i64) -> Result<Option<User>>;
    async fn active_servers(&self, protocol: VpnProtocol) -> Result<Vec<Server>>;
    async fn has_active_paid_subscription(&self, user_id: i64, now: i64) -> Result<bool>;

    /// Referrals of `user_id` with `bonus_issued=true` that themselves have
    /// at least one completed paid payment created on or before `cutoff`.
    async fn eligible_referral_count(&self, user_id: i64, cutoff: i64) -> Result<i64>;
    async fn referrals(&self, user_id: i64) -> Result<Vec<Referral>>;
}

/// Aggregate handle threaded through the services; mirrors the teacher's
/// `StorageProvider` wrapper holding related engines behind one clonable type.
#[derive(Clone)]
pub struct Store {
    pub payments: std::sync::Arc<dyn PaymentRepo>,
    pub subscriptions: std::sync::Arc<dyn SubscriptionRepo>,
    pub keys: std::sync::Arc<dyn KeyRepo>,
    pub catalog: std::sync::Arc<dyn CatalogRepo>,
}
