//! VPN protocol adapters (SPEC_FULL.md §4.7): create/delete a credential on
//! one remote server, render client config, reset traffic counters. Pooled
//! per `server_id` within a fan-out scope by `VpnClientPool`.

mod outline;
mod v2ray;

pub use outline::OutlineAdapter;
pub use v2ray::V2rayAdapter;

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum CredentialHandle {
    Outline { key_id: String, access_url: String },
    V2ray { uuid: String },
}

/// Contract shared by every concrete VPN protocol adapter. One instance is
/// bound to one remote server.
#[async_trait]
pub trait VpnAdapter: Send + Sync {
    fn server_id(&self) -> i64;

    async fn create_user(&self, label: &str) -> Result<CredentialHandle>;

    /// v2ray-only: render a single-line `vless://...` client config.
    async fn get_user_config(&self, handle: &CredentialHandle) -> Result<Option<String>>;

    async fn delete_user(&self, handle: &CredentialHandle) -> Result<()>;

    /// Reset the remote traffic counter for one credential. Best-effort:
    /// servers that don't support this simply no-op.
    async fn reset_traffic(&self, _handle: &CredentialHandle) -> Result<()> {
        Ok(())
    }
}

/// Reuses one adapter instance per `server_id` across retries within a
/// single fan-out, and never shares instances across unrelated subscriptions
/// (SPEC_FULL.md §5).
#[derive(Default)]
pub struct VpnClientPool {
    v2ray: DashMap<i64, Arc<dyn VpnAdapter>>,
    outline: DashMap<i64, Arc<dyn VpnAdapter>>,
}

impl VpnClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_v2ray(
        &self,
        server_id: i64,
        make: impl FnOnce() -> Arc<dyn VpnAdapter>,
    ) -> Arc<dyn VpnAdapter> {
        self.v2ray.entry(server_id).or_insert_with(make).clone()
    }

    pub fn get_or_insert_outline(
        &self,
        server_id: i64,
        make: impl FnOnce() -> Arc<dyn VpnAdapter>,
    ) -> Arc<dyn VpnAdapter> {
        self.outline.entry(server_id).or_insert_with(make).clone()
    }
}

/// Builds a protocol-appropriate adapter for a catalog `Server` row and
/// caches it in a `VpnClientPool`, so a fan-out across many subscriptions
/// reuses one client per server instead of opening a connection per call.
pub struct DefaultVpnAdapterFactory {
    pool: VpnClientPool,
    per_call_timeout: std::time::Duration,
}

impl DefaultVpnAdapterFactory {
    pub fn new(per_call_timeout: std::time::Duration) -> Self {
        DefaultVpnAdapterFactory {
            pool: VpnClientPool::new(),
            per_call_timeout,
        }
    }

    pub fn for_server(&self, server: &crate::types::Server) -> Arc<dyn VpnAdapter> {
        match server.protocol {
            crate::types::VpnProtocol::V2ray => {
                let api_url = server.api_url.clone();
                let api_key = server.api_key.clone();
                let id = server.id;
                let timeout = self.per_call_timeout;
                self.pool.get_or_insert_v2ray(id, move || {
                    Arc::new(V2rayAdapter::new(id, api_url, api_key, timeout))
                })
            }
            crate::types::VpnProtocol::Outline => {
                let api_url = server.api_url.clone();
                let id = server.id;
                let timeout = self.per_call_timeout;
                self.pool
                    .get_or_insert_outline(id, move || Arc::new(OutlineAdapter::new(id, api_url, timeout)))
            }
        }
    }
}
