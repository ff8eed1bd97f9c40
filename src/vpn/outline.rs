//! Outline (Shadowsocks management API) adapter. No client-config render
//! step: the access URL returned by the server is the config.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{PaymentCoreError, Result};

use super::{CredentialHandle, VpnAdapter};

pub struct OutlineAdapter {
    server_id: i64,
    api_url: String,
    client: reqwest::Client,
}

impl OutlineAdapter {
    pub fn new(server_id: i64, api_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true) // Outline management APIs use self-signed certs.
            .build()
            .expect("reqwest client");
        OutlineAdapter {
            server_id,
            api_url,
            client,
        }
    }

    fn fake(&self) -> bool {
        self.api_url.is_empty() || self.api_url.contains("test")
    }
}

#[async_trait]
impl VpnAdapter for OutlineAdapter {
    fn server_id(&self) -> i64 {
        self.server_id
    }

    async fn create_user(&self, label: &str) -> Result<CredentialHandle> {
        if self.fake() {
            let key_id = uuid::Uuid::new_v4().to_string();
            return Ok(CredentialHandle::Outline {
                access_url: format!("ss://fake@{label}:8388#{key_id}"),
                key_id,
            });
        }
        let resp = self
            .client
            .post(format!("{}/access-keys", self.api_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::vpn(
                "outline",
                self.server_id,
                format!("create_user failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        let key_id = value
            .get("id")
            .map(|v| v.to_string())
            .ok_or_else(|| PaymentCoreError::vpn("outline", self.server_id, "missing id in response"))?;
        let access_url = value
            .get("accessUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::vpn("outline", self.server_id, "missing accessUrl"))?
            .to_string();

        // Best-effort label rename; outline keys are anonymous by default.
        let _ = self
            .client
            .put(format!("{}/access-keys/{key_id}/name", self.api_url))
            .json(&serde_json::json!({ "name": label }))
            .send()
            .await;

        Ok(CredentialHandle::Outline { key_id, access_url })
    }

    async fn get_user_config(&self, handle: &CredentialHandle) -> Result<Option<String>> {
        let CredentialHandle::Outline { access_url, .. } = handle else {
            return Ok(None);
        };
        Ok(Some(access_url.clone()))
    }

    async fn delete_user(&self, handle: &CredentialHandle) -> Result<()> {
        let CredentialHandle::Outline { key_id, .. } = handle else {
            return Ok(());
        };
        if self.fake() {
            return Ok(());
        }
        let _ = self
            .client
            .delete(format!("{}/access-keys/{key_id}", self.api_url))
            .send()
            .await;
        Ok(())
    }
}
