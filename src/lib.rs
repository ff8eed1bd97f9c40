// Payment and subscription lifecycle engine for a VPN service.
//
// Ties together provider payment adapters (YooKassa, Platega, CryptoBot),
// VPN credential adapters (Outline, V2ray), and a SQLite-backed store behind
// a small set of orchestration services. To run it, use the binary target:
//
//   cargo run --bin payment_core
//
// This file exists to maintain the library structure while the actual
// server implementation is in src/bin/payment_core.rs.
//
// # Architecture
//
// * **types**: shared domain types — payments, subscriptions, credentials,
//   and the read-only catalog rows the core consults but never writes.
// * **store**: persistence traits (`PaymentRepo`, `SubscriptionRepo`,
//   `KeyRepo`, `CatalogRepo`) plus the SQLite implementation.
// * **providers**: payment provider adapters behind one `ProviderAdapter`
//   trait — creation, status polling, refunds, webhook parsing/verification.
// * **vpn**: VPN credential adapters behind one `VpnAdapter` trait — Outline
//   and V2ray, pooled per server.
// * **services**: orchestration — `PaymentService`, `WebhookService`,
//   `SubscriptionPurchaseService`, `Reconciler`.
// * **api**: the HTTP surface — webhooks, admin endpoints, health/stats.
// * **config**: layered configuration and the admin CLI surface.

pub mod error;
pub mod types;

pub mod store;

pub mod providers;
pub mod vpn;

/// Decides whether a non-subscription payment is a renewal of an existing
/// credential versus a brand-new issuance, by checking for an active
/// credential of the same protocol already held by the user.
pub mod renewal_detector;

pub mod notifier;

/// Orchestration layer tying storage, providers, and VPN adapters together:
/// `PaymentService`, `WebhookService`, `SubscriptionPurchaseService`, and the
/// background `Reconciler`.
pub mod services;

pub mod api;

pub mod config;
