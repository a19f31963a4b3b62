use crate::{
    db::DbPool,
    entities::payment::{self, Entity as PaymentEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::PaymentGateway,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What a provider status means for the local payment. Unrecognized statuses
/// refresh the raw snapshot and nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    Approve,
    Reject,
    Cancel,
    Expire,
    RefreshOnly,
}

impl ReconcileAction {
    pub fn from_provider_status(status: Option<&str>) -> Self {
        match status.map(str::to_ascii_lowercase).as_deref() {
            Some("approved") => ReconcileAction::Approve,
            Some("rejected") => ReconcileAction::Reject,
            Some("cancelled") => ReconcileAction::Cancel,
            Some("expired") => ReconcileAction::Expire,
            _ => ReconcileAction::RefreshOnly,
        }
    }
}

/// Applies provider-confirmed payment outcomes delivered via webhook.
/// Payment state only; advancing the order or crediting loyalty points is
/// downstream of the events this emits.
#[derive(Clone)]
pub struct WebhookReconciler {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Option<Arc<EventSender>>,
}

impl WebhookReconciler {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, "Failed to send event");
            }
        }
    }

    /// Processes one webhook notification end to end. Returns the payment as
    /// persisted after reconciliation.
    #[instrument(skip(self, payload))]
    pub async fn process(&self, payload: &Value) -> Result<payment::Model, ServiceError> {
        if payload.is_null()
            || payload
                .as_object()
                .map(|o| o.is_empty())
                .unwrap_or(false)
        {
            return Err(ServiceError::ValidationError(
                "Webhook payload is empty".to_string(),
            ));
        }

        let descriptor = self.gateway.process_webhook(payload).await;
        if !descriptor.valid {
            return Err(ServiceError::ValidationError(
                descriptor
                    .error_message
                    .unwrap_or_else(|| "Webhook payload could not be interpreted".to_string()),
            ));
        }
        let external_id = descriptor
            .external_payment_id
            .ok_or_else(|| {
                ServiceError::ValidationError("Webhook payload has no payment id".to_string())
            })?;

        let db = &*self.db_pool;
        let mut payment = PaymentEntity::find()
            .filter(payment::Column::ExternalPaymentId.eq(external_id.as_str()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment found for external id {}",
                    external_id
                ))
            })?;

        let action = ReconcileAction::from_provider_status(descriptor.status.as_deref());
        let applied = apply_action(&mut payment, action);

        // The raw payload is kept no matter what the status mapped to.
        payment.update_external_response(payload.clone());
        let payment = persist_payment(db, payment).await?;

        if applied {
            info!(
                payment_id = %payment.id,
                status = %payment.status,
                "Payment reconciled from webhook"
            );
            match action {
                ReconcileAction::Approve => self.emit(Event::PaymentApproved(payment.id)).await,
                ReconcileAction::Reject => self.emit(Event::PaymentRejected(payment.id)).await,
                ReconcileAction::Cancel => self.emit(Event::PaymentCancelled(payment.id)).await,
                ReconcileAction::Expire => self.emit(Event::PaymentExpired(payment.id)).await,
                ReconcileAction::RefreshOnly => {}
            }
        }
        Ok(payment)
    }

}

/// Returns whether a transition was applied. A state error here is the
/// benign duplicate-webhook case (e.g. a second "approved" for an
/// already-approved payment); it is logged and swallowed so the webhook
/// can still be acknowledged.
fn apply_action(payment: &mut payment::Model, action: ReconcileAction) -> bool {
    let result = match action {
        ReconcileAction::Approve => payment.approve(),
        ReconcileAction::Reject => payment.reject(Some("Rejeitado pelo provedor".to_string())),
        ReconcileAction::Cancel => payment.cancel(Some("Cancelado pelo provedor".to_string())),
        ReconcileAction::Expire => payment.expire(),
        ReconcileAction::RefreshOnly => return false,
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(
                payment_id = %payment.id,
                action = ?action,
                error = %e,
                "Webhook transition not applicable; keeping current status"
            );
            false
        }
    }
}

async fn persist_payment<C: ConnectionTrait>(
    conn: &C,
    payment: payment::Model,
) -> Result<payment::Model, ServiceError> {
    let id = payment.id;
    let guard_version = payment.version;
    let mut updated = payment;
    updated.version += 1;

    let result = PaymentEntity::update_many()
        .set(updated.clone().into_active_model().reset_all())
        .filter(payment::Column::Id.eq(id))
        .filter(payment::Column::Version.eq(guard_version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(id));
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment::{PaymentMethod, PaymentStatus};
    use crate::gateway::{
        parse_webhook_payload, GatewayRequest, GatewayResponse, WebhookDescriptor,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use sea_orm::{DatabaseBackend, MockDatabase};
    use uuid::Uuid;

    /// Gateway stand-in that confirms every payment notification as approved
    /// without talking to a provider.
    struct ApprovingGateway;

    #[async_trait]
    impl PaymentGateway for ApprovingGateway {
        async fn create_checkout(&self, _request: &GatewayRequest) -> GatewayResponse {
            GatewayResponse::default()
        }

        async fn create_pix_payment(&self, _request: &GatewayRequest) -> GatewayResponse {
            GatewayResponse::default()
        }

        async fn get_payment(&self, _external_payment_id: &str) -> GatewayResponse {
            GatewayResponse::default()
        }

        async fn cancel_payment(&self, _external_payment_id: &str) -> GatewayResponse {
            GatewayResponse::default()
        }

        async fn process_webhook(&self, payload: &Value) -> WebhookDescriptor {
            let mut descriptor = parse_webhook_payload(payload);
            if descriptor.valid {
                descriptor.status = Some("approved".to_string());
            }
            descriptor
        }
    }

    #[tokio::test]
    async fn webhook_for_unknown_external_id_is_not_found() {
        // No payment row carries the external id the webhook references.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<payment::Model>::new()])
            .into_connection();
        let reconciler =
            WebhookReconciler::new(Arc::new(db), Arc::new(ApprovingGateway), None);

        let payload = serde_json::json!({ "type": "payment", "data": { "id": "X" } });
        let err = reconciler.process(&payload).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn webhook_with_non_payment_type_is_rejected_before_lookup() {
        // No query results queued: an invalid payload must never reach the db.
        let db = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let reconciler =
            WebhookReconciler::new(Arc::new(db), Arc::new(ApprovingGateway), None);

        let payload = serde_json::json!({ "type": "merchant_order", "data": { "id": 7 } });
        let err = reconciler.process(&payload).await.unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn provider_statuses_map_case_insensitively() {
        assert_eq!(
            ReconcileAction::from_provider_status(Some("approved")),
            ReconcileAction::Approve
        );
        assert_eq!(
            ReconcileAction::from_provider_status(Some("APPROVED")),
            ReconcileAction::Approve
        );
        assert_eq!(
            ReconcileAction::from_provider_status(Some("Rejected")),
            ReconcileAction::Reject
        );
        assert_eq!(
            ReconcileAction::from_provider_status(Some("cancelled")),
            ReconcileAction::Cancel
        );
        assert_eq!(
            ReconcileAction::from_provider_status(Some("expired")),
            ReconcileAction::Expire
        );
    }

    #[test]
    fn unknown_or_missing_status_is_refresh_only() {
        assert_eq!(
            ReconcileAction::from_provider_status(Some("in_mediation")),
            ReconcileAction::RefreshOnly
        );
        assert_eq!(
            ReconcileAction::from_provider_status(None),
            ReconcileAction::RefreshOnly
        );
    }

    #[test]
    fn rejection_carries_the_provider_reason() {
        let mut payment = payment::Model::new(Uuid::new_v4(), PaymentMethod::Pix, dec!(50.00));
        assert!(payment.reject(Some("Rejeitado pelo provedor".into())).is_ok());
        assert_eq!(payment.status, PaymentStatus::Rejected);
        assert_eq!(
            payment.failure_reason.as_deref(),
            Some("Rejeitado pelo provedor")
        );
    }

    #[test]
    fn duplicate_approve_is_swallowed_as_benign() {
        let mut payment = payment::Model::new(Uuid::new_v4(), PaymentMethod::Pix, dec!(50.00));
        assert!(apply_action(&mut payment, ReconcileAction::Approve));
        assert_eq!(payment.status, PaymentStatus::Approved);

        assert!(!apply_action(&mut payment, ReconcileAction::Approve));
        assert_eq!(payment.status, PaymentStatus::Approved);
    }

    #[test]
    fn refresh_only_never_touches_status() {
        let mut payment = payment::Model::new(Uuid::new_v4(), PaymentMethod::Pix, dec!(50.00));
        assert!(!apply_action(&mut payment, ReconcileAction::RefreshOnly));
        assert_eq!(payment.status, PaymentStatus::Pending);
    }
}
