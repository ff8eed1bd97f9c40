//! YooKassa adapter. Authentication is by source-IP allowlist *or* a shared
//! secret header — either suffices (SPEC_FULL.md §4.4).

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{PaymentCoreError, Result};

use super::{is_fake_credential, CreatePaymentRequest, CreatedPayment, NormalizedStatus, ProviderAdapter};

pub struct YooKassaAdapter {
    shop_id: String,
    api_key: String,
    secret_header: Option<String>,
    return_url: String,
    client: reqwest::Client,
    /// Known YooKassa egress ranges; a production deployment should keep
    /// this list in config rather than hard-coding it.
    ip_allowlist: Vec<IpAddr>,
}

impl YooKassaAdapter {
    pub fn new(shop_id: String, api_key: String, secret_header: Option<String>, return_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        YooKassaAdapter {
            shop_id,
            api_key,
            secret_header,
            return_url,
            client,
            ip_allowlist: Vec::new(),
        }
    }

    fn fake(&self) -> bool {
        is_fake_credential(&self.api_key)
    }
}

#[async_trait]
impl ProviderAdapter for YooKassaAdapter {
    fn name(&self) -> &'static str {
        "yookassa"
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatedPayment> {
        if self.fake() {
            return Ok(CreatedPayment {
                provider_payment_id: format!("fake-yookassa-{}", req.external_id),
                confirmation_url: format!("https://yookassa.test/confirm/{}", req.external_id),
            });
        }

        let rubles = req.amount_minor_units as f64 / 100.0;
        let body = serde_json::json!({
            "amount": { "value": format!("{:.2}", rubles), "currency": req.currency },
            "confirmation": { "type": "redirect", "return_url": self.return_url },
            "capture": true,
            "description": req.description,
            "metadata": req.metadata,
        });

        let resp = self
            .client
            .post("https://api.yookassa.ru/v3/payments")
            .basic_auth(&self.shop_id, Some(&self.api_key))
            .header("Idempotence-Key", &req.external_id)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "yookassa",
                format!("create_payment failed with status {}", resp.status()),
            ));
        }

        let value: serde_json::Value = resp.json().await?;
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::provider("yookassa", "missing id in response"))?
            .to_string();
        let confirmation_url = value
            .get("confirmation")
            .and_then(|c| c.get("confirmation_url"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(CreatedPayment {
            provider_payment_id: id,
            confirmation_url,
        })
    }

    async fn check_payment(&self, provider_payment_id: &str) -> Result<bool> {
        if self.fake() {
            return Ok(true);
        }
        let resp = self
            .client
            .get(format!("https://api.yookassa.ru/v3/payments/{provider_payment_id}"))
            .basic_auth(&self.shop_id, Some(&self.api_key))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Provider forgot an old record; treat as paid per §7 tolerance policy.
            return Ok(true);
        }
        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "yookassa",
                format!("check_payment failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        Ok(value.get("status").and_then(|v| v.as_str()) == Some("succeeded"))
    }

    async fn refund_payment(
        &self,
        provider_payment_id: &str,
        amount_minor_units: i64,
        reason: &str,
    ) -> Result<bool> {
        if self.fake() {
            return Ok(true);
        }
        let rubles = amount_minor_units as f64 / 100.0;
        let body = serde_json::json!({
            "amount": { "value": format!("{:.2}", rubles), "currency": "RUB" },
            "payment_id": provider_payment_id,
            "description": reason,
        });
        let resp = self
            .client
            .post("https://api.yookassa.ru/v3/refunds")
            .basic_auth(&self.shop_id, Some(&self.api_key))
            .json(&body)
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<(String, NormalizedStatus)> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let object = value
            .get("object")
            .ok_or_else(|| PaymentCoreError::validation("yookassa webhook missing object"))?;
        let id = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::validation("yookassa webhook missing id"))?
            .to_string();
        let event = value.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let status = match event {
            "payment.succeeded" => NormalizedStatus::Paid,
            "payment.canceled" => NormalizedStatus::Failed,
            "payment.waiting_for_capture" => NormalizedStatus::Pending,
            _ => NormalizedStatus::Unknown,
        };
        Ok((id, status))
    }

    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        _body: &[u8],
        remote_ip: Option<IpAddr>,
    ) -> bool {
        if let Some(ip) = remote_ip {
            if self.ip_allowlist.contains(&ip) {
                return true;
            }
        }
        if let Some(secret) = &self.secret_header {
            if let Some(got) = headers.get("x-yookassa-secret") {
                return got == secret;
            }
        }
        false
    }
}
