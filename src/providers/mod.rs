//! Payment provider adapters (SPEC_FULL.md §4.6). Each adapter knows how to
//! create a remote payment, poll its status, refund it, and parse/verify its
//! webhook shape. A "fake" mode lets `create_payment` synthesize a result
//! without network I/O, which CI relies on.

mod cryptobot;
mod platega;
mod yookassa;

pub use cryptobot::CryptoBotAdapter;
pub use platega::PlategaAdapter;
pub use yookassa::YooKassaAdapter;

use crate::error::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedStatus {
    Paid,
    Failed,
    Pending,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub provider_payment_id: String,
    pub confirmation_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePaymentRequest {
    pub amount_minor_units: i64,
    pub currency: String,
    pub description: String,
    pub email: Option<String>,
    pub external_id: String,
    pub metadata: serde_json::Value,
}

/// Contract shared by every concrete payment provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatedPayment>;

    async fn check_payment(&self, provider_payment_id: &str) -> Result<bool>;

    async fn refund_payment(
        &self,
        provider_payment_id: &str,
        amount_minor_units: i64,
        reason: &str,
    ) -> Result<bool>;

    /// Parse an inbound webhook body into (provider_payment_id, status).
    fn parse_webhook(&self, body: &[u8]) -> Result<(String, NormalizedStatus)>;

    /// Verify the inbound request is authentic. `headers` are lower-cased
    /// header names mapped to values; `remote_ip` is the caller's address
    /// when known (used by providers that trust an IP allowlist).
    fn verify_webhook(
        &self,
        headers: &std::collections::HashMap<String, String>,
        body: &[u8],
        remote_ip: Option<std::net::IpAddr>,
    ) -> bool;
}

/// Shared "fake mode" switch: when a provider is constructed with a
/// placeholder credential (empty string, or the literal `"test"`), it never
/// performs network I/O and synthesizes deterministic-looking results. This
/// is what lets the test suite and CI exercise PaymentService without
/// reaching the real provider.
pub(crate) fn is_fake_credential(credential: &str) -> bool {
    credential.is_empty() || credential.eq_ignore_ascii_case("test")
}
