//! Composition root: wires config, storage, provider adapters, VPN adapters,
//! notifier, and services together, then either serves HTTP + the background
//! reconciler or runs a single admin subcommand (SPEC_FULL.md §6).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use vpn_payment_core::api::{build_router, AppState};
use vpn_payment_core::config::{self, AppConfig, Cli, Command};
use vpn_payment_core::error::Result;
use vpn_payment_core::notifier::{BotHandleTransport, HttpBotTransport, Notifier};
use vpn_payment_core::providers::{CryptoBotAdapter, PlategaAdapter, ProviderAdapter, YooKassaAdapter};
use vpn_payment_core::services::payment_service::ProviderRegistry;
use vpn_payment_core::services::{PaymentService, Reconciler, SubscriptionPurchaseService, WebhookService};
use vpn_payment_core::store::{SqliteStore, Store};
use vpn_payment_core::types::PaymentProvider;
use vpn_payment_core::vpn::DefaultVpnAdapterFactory;

struct Composition {
    store: Store,
    providers: Arc<ProviderRegistry>,
    payment_service: Arc<PaymentService>,
    webhook_service: Arc<WebhookService>,
    reconciler: Arc<Reconciler>,
}

fn build(config: &AppConfig) -> Result<Composition> {
    let sqlite = Arc::new(SqliteStore::open(Path::new(&config.storage.database_path))?);
    let store = Store {
        payments: sqlite.clone(),
        subscriptions: sqlite.clone(),
        keys: sqlite.clone(),
        catalog: sqlite,
    };

    let mut adapters: HashMap<PaymentProvider, Arc<dyn ProviderAdapter>> = HashMap::new();
    if let (Some(shop_id), Some(api_key)) = (
        config.providers.yookassa_shop_id.clone(),
        config.providers.yookassa_api_key.clone(),
    ) {
        adapters.insert(
            PaymentProvider::Yookassa,
            Arc::new(YooKassaAdapter::new(
                shop_id,
                api_key,
                config.providers.yookassa_webhook_secret.clone(),
                config.providers.return_url.clone(),
            )),
        );
    }
    if let (Some(merchant_id), Some(secret)) = (
        config.providers.platega_merchant_id.clone(),
        config.providers.platega_secret.clone(),
    ) {
        adapters.insert(
            PaymentProvider::Platega,
            Arc::new(PlategaAdapter::new(merchant_id, secret, config.providers.return_url.clone())),
        );
    }
    if let Some(token) = config.providers.cryptobot_token.clone() {
        adapters.insert(PaymentProvider::Cryptobot, Arc::new(CryptoBotAdapter::new(token, None)));
    }
    let providers = Arc::new(ProviderRegistry::new(adapters));

    let transports: Vec<Arc<dyn vpn_payment_core::notifier::NotificationTransport>> =
        match config.notifications.bot_token.clone() {
            Some(token) => vec![Arc::new(HttpBotTransport::new(token))],
            None => {
                let (tx, _rx) = tokio::sync::mpsc::channel(64);
                vec![Arc::new(BotHandleTransport::new(tx))]
            }
        };
    let notifier = Arc::new(Notifier::new(transports, config.notifications.admin_user_id));

    let vpn_factory = Arc::new(DefaultVpnAdapterFactory::new(Duration::from_secs(
        config.vpn.per_call_timeout_seconds,
    )));

    let purchase_service = Arc::new(SubscriptionPurchaseService::new(
        store.clone(),
        vpn_factory.clone(),
        notifier.clone(),
        config.vpn.public_host.clone(),
        config.vpn.primary_outline_server_id,
    ));

    let payment_service = Arc::new(
        PaymentService::new(
            store.clone(),
            providers.clone(),
            purchase_service.clone(),
            vpn_factory.clone(),
            notifier,
        )
        .with_poll_timing(
            Duration::from_secs(config.timing.payment_timeout_minutes * 60),
            Duration::from_secs(config.timing.pending_check_interval_seconds),
        ),
    );

    let webhook_service = Arc::new(WebhookService::new(store.clone(), payment_service.clone()));

    let reconciler = Arc::new(
        Reconciler::new(store.clone(), providers.clone(), purchase_service, vpn_factory)
            .with_cleanup_expired_hours(config.timing.cleanup_expired_hours),
    );

    Ok(Composition {
        store,
        providers,
        payment_service,
        webhook_service,
        reconciler,
    })
}

async fn serve(config: AppConfig) -> Result<()> {
    let composition = build(&config)?;
    let reconciler_handle = composition
        .reconciler
        .clone()
        .spawn(Duration::from_secs(config.timing.reconcile_interval_seconds));

    let state = AppState {
        store: composition.store,
        providers: composition.providers,
        payment_service: composition.payment_service,
        webhook_service: composition.webhook_service,
        reconciler: composition.reconciler,
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.api.bind_address, config.api.port)
        .parse()
        .map_err(|e| vpn_payment_core::error::PaymentCoreError::config(format!("invalid bind address: {e}")))?;

    info!(%addr, "starting payment core HTTP server");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| vpn_payment_core::error::PaymentCoreError::internal(format!("server error: {e}")))?;

    reconciler_handle.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match config::load_config(Some(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Reconcile => match build(&config) {
            Ok(c) => {
                c.reconciler.run_once().await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Recheck { payment_id } => match build(&config) {
            Ok(c) => {
                let paid = c.payment_service.poll_until_paid(&payment_id).await?;
                info!(payment_id, paid, "recheck complete");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Refund { payment_id, reason } => match build(&config) {
            Ok(c) => {
                let outcome = c.payment_service.refund(&payment_id, &reason).await;
                info!(payment_id, ok = outcome.ok, message = ?outcome.message, "refund complete");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Retry { payment_id } => match build(&config) {
            Ok(c) => {
                c.payment_service.on_paid(&payment_id).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Issue { payment_id } => match build(&config) {
            Ok(c) => {
                c.payment_service.on_paid(&payment_id).await;
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
