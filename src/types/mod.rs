//! Shared domain types: payments, subscriptions, credentials, and the
//! read-only catalog rows (tariffs, servers, referrals, users) the core
//! consults but never writes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed-point sentinel expiry for VIP subscriptions: 2100-01-01T00:00:00Z.
pub const VIP_EXPIRES_AT: i64 = 4_102_434_000;

/// Grace period (seconds) during which a just-expired subscription is still
/// considered active for renewal-detection purposes.
pub const ACTIVE_GRACE_SECONDS: i64 = 24 * 3600;

/// Upper bound on how far into the future a non-VIP expiry may be pushed.
pub const MAX_EXPIRY_HORIZON_SECONDS: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => PaymentStatus::Pending,
            "paid" => PaymentStatus::Paid,
            "completed" => PaymentStatus::Completed,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            "refunded" => PaymentStatus::Refunded,
            "expired" => PaymentStatus::Expired,
            _ => return None,
        })
    }

    /// True once a payment can no longer change status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Failed
                | PaymentStatus::Cancelled
                | PaymentStatus::Refunded
                | PaymentStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Yookassa,
    Platega,
    Cryptobot,
    Stripe,
    Paypal,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Yookassa => "yookassa",
            PaymentProvider::Platega => "platega",
            PaymentProvider::Cryptobot => "cryptobot",
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Paypal => "paypal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "yookassa" => PaymentProvider::Yookassa,
            "platega" => PaymentProvider::Platega,
            "cryptobot" => PaymentProvider::Cryptobot,
            "stripe" => PaymentProvider::Stripe,
            "paypal" => PaymentProvider::Paypal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Sbp,
    Wallet,
    BankTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Rub,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Rub => "RUB",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "RUB" => Currency::Rub,
            "USD" => Currency::Usd,
            "EUR" => Currency::Eur,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnProtocol {
    Outline,
    V2ray,
}

impl VpnProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnProtocol::Outline => "outline",
            VpnProtocol::V2ray => "v2ray",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "outline" => VpnProtocol::Outline,
            "v2ray" => VpnProtocol::V2ray,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    All,
    Paid,
    Vip,
}

/// Recognized metadata key for whether a payment represents a subscription
/// purchase (vs. a bare one-off key issuance).
pub const METADATA_KEY_TYPE: &str = "key_type";
pub const METADATA_VALUE_SUBSCRIPTION: &str = "subscription";
pub const METADATA_PROCESSING_LOCK: &str = "_processing_subscription";
pub const METADATA_PROCESSING_LOCK_STARTED_AT: &str = "_processing_subscription_started_at";

/// Free-form provider metadata. Stored as a JSON text column; malformed
/// payloads degrade to an empty map rather than failing the read.
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub payment_id: String,
    pub user_id: i64,
    pub tariff_id: i64,
    pub amount: i64,
    pub currency: Currency,
    pub email: Option<String>,
    pub status: PaymentStatus,
    pub country: Option<String>,
    pub protocol: Option<VpnProtocol>,
    pub provider: PaymentProvider,
    pub method: Option<PaymentMethod>,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub paid_at: Option<i64>,
    pub metadata: Metadata,
    pub subscription_id: Option<i64>,
}

impl Payment {
    pub fn is_subscription_payment(&self) -> bool {
        self.metadata
            .get(METADATA_KEY_TYPE)
            .and_then(|v| v.as_str())
            .map(|s| s == METADATA_VALUE_SUBSCRIPTION)
            .unwrap_or(false)
            && self.protocol == Some(VpnProtocol::V2ray)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub subscription_token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub tariff_id: i64,
    pub is_active: bool,
    pub last_updated_at: i64,
    pub purchase_notification_sent: bool,
    pub traffic_limit_mb: i64,
}

impl Subscription {
    pub fn is_active_at(&self, now: i64) -> bool {
        self.expires_at > now - ACTIVE_GRACE_SECONDS
    }

    pub fn is_vip(&self) -> bool {
        self.expires_at >= VIP_EXPIRES_AT - 86_400
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineKey {
    pub id: i64,
    pub server_id: i64,
    pub user_id: i64,
    pub access_url: String,
    pub traffic_limit_mb: i64,
    pub key_id: String,
    pub created_at: i64,
    pub email: String,
    pub tariff_id: i64,
    pub subscription_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V2rayKey {
    pub id: i64,
    pub server_id: i64,
    pub user_id: i64,
    pub v2ray_uuid: String,
    pub email: String,
    pub created_at: i64,
    pub tariff_id: i64,
    pub client_config: String,
    pub subscription_id: Option<i64>,
    pub traffic_limit_mb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub protocol: VpnProtocol,
    pub api_url: String,
    pub api_key: Option<String>,
    pub country: Option<String>,
    pub active: bool,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tariff {
    pub id: i64,
    pub name: String,
    pub duration_sec: i64,
    pub price_minor_units: i64,
    pub currency: Currency,
    pub traffic_limit_mb: i64,
    pub is_vip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_vip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub referrer_id: i64,
    pub referred_id: i64,
    pub bonus_issued: bool,
}

/// Filter structure for `PaymentRepo::filter` / `count_filtered`.
#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub user_id: Option<i64>,
    pub tariff_id: Option<i64>,
    pub status: Option<PaymentStatus>,
    pub provider: Option<PaymentProvider>,
    pub protocol: Option<VpnProtocol>,
    pub country: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    CreatedAt,
    Status,
    Amount,
    PaidAt,
    UpdatedAt,
}

impl SortBy {
    /// Any unrecognized column name falls back to `created_at` (whitelist).
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "status" => SortBy::Status,
            "amount" => SortBy::Amount,
            "paid_at" => SortBy::PaidAt,
            "updated_at" => SortBy::UpdatedAt,
            _ => SortBy::CreatedAt,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            SortBy::CreatedAt => "created_at",
            SortBy::Status => "status",
            SortBy::Amount => "amount",
            SortBy::PaidAt => "paid_at",
            SortBy::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Desc
    }
}

/// Summary statistics surfaced by `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatistics {
    pub total_payments: i64,
    pub completed_payments: i64,
    pub completed_amount_sum: i64,
}

/// Non-raising outcome type for operations whose contract forbids exceptions
/// escaping to the caller (SubscriptionPurchaseService::process, reconciler
/// sweeps). Every failure path is still observable through `message`.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub ok: bool,
    pub message: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Outcome {
            ok: true,
            message: None,
        }
    }

    pub fn success_with<S: Into<String>>(message: S) -> Self {
        Outcome {
            ok: true,
            message: Some(message.into()),
        }
    }

    pub fn failure<S: Into<String>>(message: S) -> Self {
        Outcome {
            ok: false,
            message: Some(message.into()),
        }
    }
}
