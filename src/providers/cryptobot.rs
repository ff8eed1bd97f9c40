//! CryptoBot adapter. Webhook authentication is payload-shape validation
//! (requires `update_type`, and for `invoice_paid` a nested `invoice_id`)
//! plus an optional secret header (SPEC_FULL.md §4.4).

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{PaymentCoreError, Result};

use super::{is_fake_credential, CreatePaymentRequest, CreatedPayment, NormalizedStatus, ProviderAdapter};

pub struct CryptoBotAdapter {
    api_token: String,
    secret_header: Option<String>,
    client: reqwest::Client,
}

impl CryptoBotAdapter {
    pub fn new(api_token: String, secret_header: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        CryptoBotAdapter {
            api_token,
            secret_header,
            client,
        }
    }

    fn fake(&self) -> bool {
        is_fake_credential(&self.api_token)
    }
}

#[async_trait]
impl ProviderAdapter for CryptoBotAdapter {
    fn name(&self) -> &'static str {
        "cryptobot"
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatedPayment> {
        if self.fake() {
            return Ok(CreatedPayment {
                provider_payment_id: format!("fake-cryptobot-{}", req.external_id),
                confirmation_url: format!("https://t.me/CryptoBot?start=fake-{}", req.external_id),
            });
        }

        let amount_usd = req.amount_minor_units as f64 / 100.0;
        let body = serde_json::json!({
            "asset": "USDT",
            "amount": format!("{:.2}", amount_usd),
            "description": req.description,
            "payload": req.external_id,
        });

        let resp = self
            .client
            .post("https://pay.crypt.bot/api/createInvoice")
            .header("Crypto-Pay-API-Token", &self.api_token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "cryptobot",
                format!("create_payment failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        let result = value.get("result").unwrap_or(&value);
        let id = result
            .get("invoice_id")
            .map(|v| v.to_string())
            .ok_or_else(|| PaymentCoreError::provider("cryptobot", "missing invoice_id"))?;
        let confirmation_url = result
            .get("pay_url")
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
            .get("https://pay.crypt.bot/api/getInvoices")
            .header("Crypto-Pay-API-Token", &self.api_token)
            .query(&[("invoice_ids", provider_payment_id)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "cryptobot",
                format!("check_payment failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        let paid = value["result"]["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("status"))
            .and_then(|s| s.as_str())
            == Some("paid");
        Ok(paid)
    }

    async fn refund_payment(
        &self,
        _provider_payment_id: &str,
        _amount_minor_units: i64,
        _reason: &str,
    ) -> Result<bool> {
        Err(PaymentCoreError::provider(
            "cryptobot",
            "refunds are not supported for crypto invoices",
        ))
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<(String, NormalizedStatus)> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let update_type = value
            .get("update_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::validation("cryptobot webhook missing update_type"))?;

        if update_type != "invoice_paid" {
            return Ok(("".to_string(), NormalizedStatus::Unknown));
        }

        let invoice_id = value
            .get("payload")
            .and_then(|p| p.get("invoice_id"))
            .map(|v| v.to_string())
            .ok_or_else(|| PaymentCoreError::validation("cryptobot webhook missing invoice_id"))?;

        Ok((invoice_id, NormalizedStatus::Paid))
    }

    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
        _remote_ip: Option<IpAddr>,
    ) -> bool {
        // Shape validation first: a payload that doesn't even parse or lacks
        // update_type is rejected regardless of the secret header.
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return false;
        };
        if value.get("update_type").and_then(|v| v.as_str()).is_none() {
            return false;
        }
        if let Some(secret) = &self.secret_header {
            return headers.get("crypto-pay-api-signature") == Some(secret);
        }
        true
    }
}
