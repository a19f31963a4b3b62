use crate::{
    db::DbPool,
    entities::order::Entity as OrderEntity,
    entities::order_item::{self, Entity as OrderItemEntity},
    entities::payment::{self, Entity as PaymentEntity, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{outbox, Event, EventSender},
    gateway::{BackUrls, GatewayLineItem, GatewayRequest, GatewayResponse, PaymentGateway},
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, TransactionTrait,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: Uuid,
    pub method: PaymentMethod,
}

/// Applies a gateway outcome to a payment. On success the payment moves to
/// PROCESSING and records the provider artifacts; on failure it is rejected
/// with the provider's message. Pure so the mapping is testable without a
/// database or a provider.
pub fn apply_gateway_result(
    payment: &mut payment::Model,
    result: &GatewayResponse,
) -> Result<(), ServiceError> {
    if let Some(raw) = &result.raw_response {
        payment.update_external_response(raw.clone());
    }

    if result.is_success() {
        payment.mark_as_processing()?;
        if result.external_payment_id.is_some() {
            payment.external_payment_id = result.external_payment_id.clone();
        }
        if result.external_preference_id.is_some() {
            payment.external_preference_id = result.external_preference_id.clone();
        }
        if result.checkout_url.is_some() {
            payment.checkout_url = result.checkout_url.clone();
        }
        if payment.method == PaymentMethod::Pix
            && (result.qr_code.is_some() || result.qr_code_base64.is_some())
        {
            payment.set_pix_data(
                result.qr_code.clone(),
                result.qr_code_base64.clone(),
                result.ticket_url.clone(),
            )?;
        }
        Ok(())
    } else {
        let reason = result
            .error_message
            .clone()
            .unwrap_or_else(|| "Rejeitado pelo provedor".to_string());
        payment.reject(Some(reason.clone()))?;
        Err(ServiceError::PaymentFailed(reason))
    }
}

/// Persists a payment using its version stamp as the optimistic guard.
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
        warn!(payment_id = %id, "payment was modified concurrently");
        return Err(ServiceError::ConcurrentModification(id));
    }
    Ok(updated)
}

/// Service for payment attempts and their provider interactions.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    back_urls: BackUrls,
    event_sender: Option<Arc<EventSender>>,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        back_urls: BackUrls,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            back_urls,
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

    /// Creates a pending payment for an order. At most one active payment may
    /// exist per order; a new attempt requires the previous one to have been
    /// rejected, cancelled or expired.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_payment(
        &self,
        request: CreatePaymentRequest,
    ) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = OrderEntity::find_by_id(request.order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", request.order_id))
            })?;

        if order.total <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Order total must be positive to create a payment".to_string(),
            ));
        }

        let active = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(
                payment::Column::Status
                    .is_in([PaymentStatus::Pending, PaymentStatus::Processing]),
            )
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(active) = active {
            return Err(ServiceError::Conflict(format!(
                "Order {} already has an active payment ({})",
                order.id, active.id
            )));
        }

        let model = payment::Model::new(order.id, request.method, order.total);
        let payment_id = model.id;
        let model = model
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, payment_id = %payment_id, "Failed to create payment");
                ServiceError::db_error(e)
            })?;
        outbox::enqueue(&txn, "payment", Some(payment_id), &Event::PaymentCreated(payment_id))
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(payment_id = %payment_id, order_id = %order.id, amount = %model.amount, "Payment created");
        self.emit(Event::PaymentCreated(payment_id)).await;
        Ok(model)
    }

    /// Sends a pending payment to the provider. Cash payments skip the
    /// provider and go straight to PROCESSING, waiting for the counter.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn process_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        let mut payment = self.get_payment(payment_id).await?;

        if payment.status != PaymentStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "payment {} cannot be processed in status {}",
                payment.id, payment.status
            )));
        }

        if !payment.method.requires_external_processing() {
            payment.mark_as_processing()?;
            return persist_payment(db, payment).await;
        }

        let request = self.build_gateway_request(&payment).await?;
        let result = match payment.method {
            PaymentMethod::Pix => self.gateway.create_pix_payment(&request).await,
            _ => self.gateway.create_checkout(&request).await,
        };

        let outcome = apply_gateway_result(&mut payment, &result);
        let payment = persist_payment(db, payment).await?;

        match outcome {
            Ok(()) => {
                info!(payment_id = %payment.id, "Payment sent to provider");
                Ok(payment)
            }
            Err(err) => {
                warn!(payment_id = %payment.id, error = %err, "Provider rejected payment");
                self.emit(Event::PaymentRejected(payment.id)).await;
                Err(err)
            }
        }
    }

    async fn build_gateway_request(
        &self,
        payment: &payment::Model,
    ) -> Result<GatewayRequest, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(payment.order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", payment.order_id))
            })?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(GatewayRequest {
            order_id: order.id,
            method: payment.method,
            amount: payment.amount,
            description: format!("Pedido #{}", order.id),
            customer_email: order.contact_email().map(str::to_string),
            items: items
                .iter()
                .map(|item| GatewayLineItem {
                    title: item.name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            back_urls: self.back_urls.clone(),
            additional_data: Some(serde_json::json!({
                "payment_id": payment.id.to_string(),
            })),
        })
    }

    /// Retrieves a payment by id.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        PaymentEntity::find_by_id(payment_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    /// Lists an order's payments, newest first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn list_payments_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let db = &*self.db_pool;
        PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Looks up a payment by the provider-side id, as webhooks identify them.
    #[instrument(skip(self))]
    pub async fn find_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let db = &*self.db_pool;
        PaymentEntity::find()
            .filter(payment::Column::ExternalPaymentId.eq(external_payment_id))
            .one(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Expires active payments older than the TTL. Failures on one payment
    /// never stop the sweep; returns how many were expired.
    #[instrument(skip(self))]
    pub async fn expire_stale_payments(&self, ttl_minutes: i64) -> Result<u64, ServiceError> {
        let db = &*self.db_pool;
        let cutoff = Utc::now() - Duration::minutes(ttl_minutes);

        let stale = PaymentEntity::find()
            .filter(
                payment::Column::Status
                    .is_in([PaymentStatus::Pending, PaymentStatus::Processing]),
            )
            .filter(payment::Column::CreatedAt.lt(cutoff))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut expired = 0u64;
        for mut payment in stale {
            let payment_id = payment.id;
            if let Err(e) = payment.expire() {
                warn!(payment_id = %payment_id, error = %e, "Skipping payment during expiration sweep");
                continue;
            }
            match persist_payment(db, payment).await {
                Ok(_) => {
                    expired += 1;
                    self.emit(Event::PaymentExpired(payment_id)).await;
                }
                Err(e) => {
                    warn!(payment_id = %payment_id, error = %e, "Failed to expire payment");
                }
            }
        }

        if expired > 0 {
            info!(expired = expired, "Expired stale payments");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order;
    use crate::gateway::demo::DemoGateway;
    use rust_decimal_macros::dec;
    use sea_orm::{DatabaseBackend, MockDatabase};
    use serde_json::json;

    fn pix_payment() -> payment::Model {
        payment::Model::new(Uuid::new_v4(), PaymentMethod::Pix, dec!(75.00))
    }

    #[test]
    fn successful_pix_result_moves_payment_to_processing() {
        let mut payment = pix_payment();
        let result = GatewayResponse {
            success: true,
            external_payment_id: Some("1234567890".into()),
            qr_code: Some("00020126...".into()),
            qr_code_base64: Some("aWdub3JlZA==".into()),
            ticket_url: Some("https://provider/pix/1234567890".into()),
            status: Some("pending".into()),
            raw_response: Some(json!({ "id": 1234567890, "status": "pending" })),
            ..Default::default()
        };

        apply_gateway_result(&mut payment, &result).unwrap();
        assert_eq!(payment.status, PaymentStatus::Processing);
        assert_eq!(payment.external_payment_id.as_deref(), Some("1234567890"));
        assert_eq!(payment.qr_code.as_deref(), Some("00020126..."));
        assert!(payment.external_response.is_some());
    }

    #[test]
    fn failed_result_rejects_payment_with_reason() {
        let mut payment = pix_payment();
        let result = GatewayResponse::error("provider request failed: timeout");

        let err = apply_gateway_result(&mut payment, &result).unwrap_err();
        assert!(matches!(err, ServiceError::PaymentFailed(_)));
        assert_eq!(payment.status, PaymentStatus::Rejected);
        assert_eq!(
            payment.failure_reason.as_deref(),
            Some("provider request failed: timeout")
        );
    }

    #[test]
    fn failed_result_without_message_uses_default_reason() {
        let mut payment = pix_payment();
        let result = GatewayResponse::default();

        assert!(apply_gateway_result(&mut payment, &result).is_err());
        assert_eq!(
            payment.failure_reason.as_deref(),
            Some("Rejeitado pelo provedor")
        );
    }

    #[test]
    fn checkout_result_keeps_preference_and_url() {
        let mut payment =
            payment::Model::new(Uuid::new_v4(), PaymentMethod::CreditCard, dec!(50.00));
        let result = GatewayResponse {
            success: true,
            external_preference_id: Some("PREF-1".into()),
            checkout_url: Some("https://provider/checkout/PREF-1".into()),
            status: Some("pending".into()),
            ..Default::default()
        };

        apply_gateway_result(&mut payment, &result).unwrap();
        assert_eq!(payment.status, PaymentStatus::Processing);
        assert_eq!(payment.external_preference_id.as_deref(), Some("PREF-1"));
        assert_eq!(
            payment.checkout_url.as_deref(),
            Some("https://provider/checkout/PREF-1")
        );
        assert!(payment.qr_code.is_none());
    }

    #[tokio::test]
    async fn second_active_payment_for_an_order_conflicts() {
        let mut order = order::Model::new_for_customer(Uuid::new_v4(), None);
        order.set_total(dec!(50.00));
        let active = payment::Model::new(order.id, PaymentMethod::Pix, order.total);

        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![order.clone()]])
            .append_query_results([vec![active]])
            .into_connection();
        let service = PaymentService::new(
            Arc::new(db),
            Arc::new(DemoGateway::new()),
            BackUrls::default(),
            None,
        );

        let err = service
            .create_payment(CreatePaymentRequest {
                order_id: order.id,
                method: PaymentMethod::CreditCard,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
