//! Orchestration layer: `PaymentService`, `SubscriptionPurchaseService`,
//! `WebhookService`, and `Reconciler`.

pub mod payment_service;
pub mod reconciler;
pub mod subscription_purchase_service;
pub mod webhook_service;

pub use payment_service::PaymentService;
pub use reconciler::Reconciler;
pub use subscription_purchase_service::SubscriptionPurchaseService;
pub use webhook_service::WebhookService;
