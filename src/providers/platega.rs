//! Platega adapter. The source does not use a cryptographic signature; the
//! webhook is trusted only after looking the payment up in the store and
//! finding its remote status literally equal to `CONFIRMED`
//! (SPEC_FULL.md §4.4). `verify_webhook` here only checks merchant headers
//! are present; the store lookup happens in `WebhookService`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::error::{PaymentCoreError, Result};

use super::{is_fake_credential, CreatePaymentRequest, CreatedPayment, NormalizedStatus, ProviderAdapter};

pub struct PlategaAdapter {
    merchant_id: String,
    secret: String,
    return_url: String,
    client: reqwest::Client,
}

impl PlategaAdapter {
    pub fn new(merchant_id: String, secret: String, return_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        PlategaAdapter {
            merchant_id,
            secret,
            return_url,
            client,
        }
    }

    fn fake(&self) -> bool {
        is_fake_credential(&self.secret)
    }
}

#[async_trait]
impl ProviderAdapter for PlategaAdapter {
    fn name(&self) -> &'static str {
        "platega"
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatedPayment> {
        if self.fake() {
            return Ok(CreatedPayment {
                provider_payment_id: format!("fake-platega-{}", req.external_id),
                confirmation_url: format!("https://platega.test/pay/{}", req.external_id),
            });
        }

        let body = serde_json::json!({
            "amount": req.amount_minor_units,
            "currency": req.currency,
            "description": req.description,
            "returnUrl": self.return_url,
            "externalId": req.external_id,
        });

        let resp = self
            .client
            .post("https://app.platega.io/transaction/process")
            .header("X-MerchantId", &self.merchant_id)
            .header("X-Secret", &self.secret)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "platega",
                format!("create_payment failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::provider("platega", "missing id in response"))?
            .to_string();
        let confirmation_url = value
            .get("paymentUrl")
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
            .get(format!("https://app.platega.io/transaction/{provider_payment_id}"))
            .header("X-MerchantId", &self.merchant_id)
            .header("X-Secret", &self.secret)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(PaymentCoreError::provider(
                "platega",
                format!("check_payment failed with status {}", resp.status()),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        Ok(value.get("status").and_then(|v| v.as_str()) == Some("CONFIRMED"))
    }

    async fn refund_payment(
        &self,
        _provider_payment_id: &str,
        _amount_minor_units: i64,
        _reason: &str,
    ) -> Result<bool> {
        // The source does not expose a refund endpoint for this provider.
        Err(PaymentCoreError::provider(
            "platega",
            "refunds are not supported for this provider",
        ))
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<(String, NormalizedStatus)> {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PaymentCoreError::validation("platega webhook missing id"))?
            .to_string();
        let status = match value.get("status").and_then(|v| v.as_str()) {
            Some("CONFIRMED") => NormalizedStatus::Paid,
            Some("FAILED") | Some("CANCELLED") => NormalizedStatus::Failed,
            Some("PENDING") => NormalizedStatus::Pending,
            _ => NormalizedStatus::Unknown,
        };
        Ok((id, status))
    }

    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        _body: &[u8],
        _remote_ip: Option<IpAddr>,
    ) -> bool {
        headers
            .get("x-merchantid")
            .map(|v| v == &self.merchant_id)
            .unwrap_or(false)
    }
}
