use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::errors::ServiceError;
use crate::AppState;

/// HTTP surface of the transactional core: health, the provider webhook and
/// the administrative expiration sweep. Handlers stay thin; everything else
/// lives in the services.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(payment_webhook))
        .route("/admin/payments/expire", post(expire_payments))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Provider notifications land here. The reconciler decides what, if
/// anything, the payload means for payment state; a benign duplicate still
/// acknowledges with 200 so the provider stops retrying.
async fn payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ServiceError> {
    let payment = state.reconciler.process(&payload).await?;
    Ok(Json(json!({
        "payment_id": payment.id,
        "status": payment.status,
    })))
}

/// Manual trigger for the expiration sweep; the same sweep also runs on a
/// timer in the background.
async fn expire_payments(State(state): State<AppState>) -> Result<Json<Value>, ServiceError> {
    let expired = state
        .payments
        .expire_stale_payments(state.config.payment_ttl_minutes)
        .await?;
    Ok(Json(json!({ "expired": expired })))
}
