use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use churras_api::{
    config::{init_tracing, load_config},
    db::establish_connection_from_app_config,
    events::{self, outbox, EventSender},
    gateway::{demo::DemoGateway, mercado_pago::MercadoPagoGateway, BackUrls, PaymentGateway},
    handlers,
    services::{
        loyalty::LoyaltyService, orders::OrderService, payments::PaymentService,
        reconciliation::WebhookReconciler,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;
    init_tracing(config.log_level(), config.log_json);
    info!(environment = %config.environment, "Starting churras-api");

    let db = Arc::new(
        establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to the database")?,
    );

    let (tx, rx) = mpsc::channel(config.event_channel_capacity);
    let event_sender = Arc::new(EventSender::new(tx));
    tokio::spawn(events::process_events(rx));
    outbox::start_worker(db.clone(), (*event_sender).clone()).await;

    let gateway: Arc<dyn PaymentGateway> = if config.mercado_pago.demo_mode {
        info!("Payment gateway running in demo mode");
        Arc::new(DemoGateway::new())
    } else {
        Arc::new(MercadoPagoGateway::new(config.mercado_pago.clone()))
    };

    let back_urls = BackUrls {
        success: config.mercado_pago.success_url.clone(),
        failure: config.mercado_pago.failure_url.clone(),
        pending: config.mercado_pago.pending_url.clone(),
    };

    let orders = Arc::new(OrderService::new(db.clone(), Some(event_sender.clone())));
    let payments = Arc::new(PaymentService::new(
        db.clone(),
        gateway.clone(),
        back_urls,
        Some(event_sender.clone()),
    ));
    let reconciler = Arc::new(WebhookReconciler::new(
        db.clone(),
        gateway.clone(),
        Some(event_sender.clone()),
    ));
    let loyalty = Arc::new(LoyaltyService::new(db.clone(), Some(event_sender.clone())));

    let config = Arc::new(config);
    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        event_sender,
        orders,
        payments: payments.clone(),
        reconciler,
        loyalty,
    };

    spawn_expiration_sweep(
        payments,
        config.payment_ttl_minutes,
        config.payment_sweep_interval_secs,
    );

    // Permissive CORS only outside production; the real deployment sits
    // behind the storefront origin.
    let app = if config.is_development() {
        handlers::routes().layer(CorsLayer::permissive())
    } else {
        handlers::routes()
    }
    .layer(TraceLayer::new_for_http())
    .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!(addr = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Periodic sweep that expires payments stuck in PENDING/PROCESSING past the
/// TTL. Sweep failures are logged and retried on the next tick.
fn spawn_expiration_sweep(payments: Arc<PaymentService>, ttl_minutes: i64, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = payments.expire_stale_payments(ttl_minutes).await {
                error!(error = %e, "Payment expiration sweep failed");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
