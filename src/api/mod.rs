//! HTTP surface (SPEC_FULL.md §6.1): inbound provider webhooks, the admin
//! surface mirrored by `config::Command`, and health/stats endpoints.
//!
//! Routing follows the teacher's `ApiServer`/`AppState` shape: one `Arc`ed
//! state struct cloned into every handler via axum's extension state, one
//! router built up with `.route(...)` calls and wrapped in `TraceLayer`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{PaymentCoreError, Result};
use crate::providers::ProviderAdapter;
use crate::services::payment_service::{CreateIntentRequest, CreateIntentResult, PaymentService, ProviderRegistry};
use crate::services::reconciler::Reconciler;
use crate::services::webhook_service::{WebhookOutcome, WebhookService};
use crate::store::Store;
use crate::types::{Outcome, PaymentProvider};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub providers: Arc<ProviderRegistry>,
    pub payment_service: Arc<PaymentService>,
    pub webhook_service: Arc<WebhookService>,
    pub reconciler: Arc<Reconciler>,
}

/// Builds the full router: webhook ingestion, admin surface, health/stats.
/// Mirrors the teacher's `create_router`, one `.route` per endpoint, state
/// attached once at the end via `.with_state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/webhooks/yookassa", post(webhook_yookassa))
        .route("/webhooks/platega", post(webhook_platega))
        .route("/webhooks/cryptobot", post(webhook_cryptobot))
        .route("/admin/reconcile", post(admin_reconcile))
        .route("/admin/payments/:payment_id/recheck", post(admin_recheck))
        .route("/admin/payments/:payment_id/refund", post(admin_refund))
        .route("/admin/payments/:payment_id/retry", post(admin_retry))
        .route("/admin/payments/:payment_id/issue", post(admin_issue))
        .route("/payments", post(create_payment_intent))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<crate::types::PaymentStatistics>> {
    let stats = state.store.payments.get_statistics().await?;
    Ok(Json(stats))
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
        .collect()
}

async fn dispatch_webhook(
    state: &AppState,
    provider: &dyn ProviderAdapter,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let headers = header_map(&headers);
    let remote_ip = remote.map(|a| a.ip());
    match state.webhook_service.handle(provider, &headers, &body, remote_ip).await {
        WebhookOutcome::Handled => StatusCode::OK.into_response(),
        WebhookOutcome::BadRequest => StatusCode::BAD_REQUEST.into_response(),
        WebhookOutcome::Unauthorized => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn webhook_yookassa(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let adapter = match state.providers.get(PaymentProvider::Yookassa) {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };
    dispatch_webhook(&state, adapter.as_ref(), headers, Some(remote), body).await
}

async fn webhook_platega(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let adapter = match state.providers.get(PaymentProvider::Platega) {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };
    dispatch_webhook(&state, adapter.as_ref(), headers, Some(remote), body).await
}

async fn webhook_cryptobot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let adapter = match state.providers.get(PaymentProvider::Cryptobot) {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };
    dispatch_webhook(&state, adapter.as_ref(), headers, Some(remote), body).await
}

async fn create_payment_intent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateIntentRequest>,
) -> Result<Json<CreateIntentResult>> {
    let result = state.payment_service.create_intent(req).await?;
    Ok(Json(result))
}

async fn admin_reconcile(State(state): State<Arc<AppState>>) -> Json<Outcome> {
    info!("admin-triggered reconciliation sweep");
    state.reconciler.run_once().await;
    Json(Outcome::success())
}

async fn admin_recheck(State(state): State<Arc<AppState>>, Path(payment_id): Path<String>) -> Result<Json<Outcome>> {
    let paid = state.payment_service.poll_until_paid(&payment_id).await?;
    Ok(Json(if paid {
        Outcome::success()
    } else {
        Outcome::failure("payment not confirmed paid by provider")
    }))
}

#[derive(Debug, Deserialize)]
struct RefundRequest {
    #[serde(default = "default_refund_reason")]
    reason: String,
}

fn default_refund_reason() -> String {
    "requested by admin".to_string()
}

async fn admin_refund(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
    body: Option<Json<RefundRequest>>,
) -> Json<Outcome> {
    let reason = body.map(|Json(r)| r.reason).unwrap_or_else(default_refund_reason);
    Json(state.payment_service.refund(&payment_id, &reason).await)
}

async fn admin_retry(State(state): State<Arc<AppState>>, Path(payment_id): Path<String>) -> Json<Outcome> {
    state.payment_service.on_paid(&payment_id).await;
    Json(Outcome::success())
}

async fn admin_issue(State(state): State<Arc<AppState>>, Path(payment_id): Path<String>) -> Json<Outcome> {
    state.payment_service.on_paid(&payment_id).await;
    Json(Outcome::success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{BotHandleTransport, Notifier};
    use crate::providers::YooKassaAdapter;
    use crate::services::SubscriptionPurchaseService;
    use crate::store::SqliteStore;
    use crate::vpn::DefaultVpnAdapterFactory;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn build_state() -> AppState {
        let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = Store {
            payments: sqlite.clone(),
            subscriptions: sqlite.clone(),
            keys: sqlite.clone(),
            catalog: sqlite.clone(),
        };
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let notifier = Arc::new(Notifier::new(vec![Arc::new(BotHandleTransport::new(tx))], None));
        let vpn_factory = Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(5)));
        let purchase_service = Arc::new(SubscriptionPurchaseService::new(
            store.clone(),
            vpn_factory.clone(),
            notifier.clone(),
            "vpn.example".to_string(),
            None,
        ));
        let mut adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            PaymentProvider::Yookassa,
            Arc::new(YooKassaAdapter::new(
                "shop".to_string(),
                "".to_string(),
                None,
                "https://return.example".to_string(),
            )),
        );
        let providers = Arc::new(ProviderRegistry::new(adapters));
        let payment_service = Arc::new(PaymentService::new(
            store.clone(),
            providers.clone(),
            purchase_service.clone(),
            vpn_factory.clone(),
            notifier,
        ));
        let webhook_service = Arc::new(WebhookService::new(store.clone(), payment_service.clone()));
        let reconciler = Arc::new(Reconciler::new(store.clone(), providers.clone(), purchase_service, vpn_factory));
        AppState {
            store,
            providers,
            payment_service,
            webhook_service,
            reconciler,
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = build_router(build_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_endpoint_returns_json() {
        let app = build_router(build_state().await);
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
