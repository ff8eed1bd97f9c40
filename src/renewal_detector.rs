//! Pure predicate over the store: does this user already hold an active
//! credential of the given protocol? Used by the reconciler's paid-without-
//! key sweep to distinguish a purchase from a renewal for non-subscription
//! payments.
//!
//! Grounded on the open question in SPEC_FULL.md §9: expiry is sourced from
//! the subscription join, never from a stale per-key expiry column — the
//! `keys`/`v2ray_keys` tables here carry no expiry column at all.

use std::sync::Arc;

use crate::error::Result;
use crate::store::KeyRepo;
use crate::types::VpnProtocol;

pub struct RenewalDetector {
    keys: Arc<dyn KeyRepo>,
}

impl RenewalDetector {
    pub fn new(keys: Arc<dyn KeyRepo>) -> Self {
        RenewalDetector { keys }
    }

    /// True if `user_id` holds a credential of `protocol` attached to a
    /// still-active subscription (i.e. this would be a renewal, not a
    /// fresh purchase).
    pub async fn is_renewal(&self, user_id: i64, protocol: VpnProtocol, now: i64) -> Result<bool> {
        self.keys.has_active_credential(user_id, protocol, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn fresh_user_is_not_a_renewal() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let detector = RenewalDetector::new(store.clone());
        let is_renewal = detector.is_renewal(1, VpnProtocol::V2ray, 1_700_000_000).await.unwrap();
        assert!(!is_renewal);
    }
}
