use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "CREDIT_CARD")]
    CreditCard,
    #[sea_orm(string_value = "DEBIT_CARD")]
    DebitCard,
    #[sea_orm(string_value = "PIX")]
    Pix,
    #[sea_orm(string_value = "BOLETO")]
    Boleto,
    #[sea_orm(string_value = "CASH")]
    Cash,
}

impl PaymentMethod {
    /// Cash is settled at the counter; everything else goes to the provider.
    pub fn requires_external_processing(&self) -> bool {
        !matches!(self, PaymentMethod::Cash)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PROCESSING")]
    Processing,
    #[sea_orm(string_value = "APPROVED")]
    Approved,
    #[sea_orm(string_value = "REJECTED")]
    Rejected,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
    #[sea_orm(string_value = "REFUNDED")]
    Refunded,
}

impl PaymentStatus {
    /// Active payments block the creation of another payment for the same
    /// order and are the ones the expiration sweep looks at.
    pub fn is_active(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Approved
                | PaymentStatus::Rejected
                | PaymentStatus::Cancelled
                | PaymentStatus::Expired
                | PaymentStatus::Refunded
        )
    }
}

/// The `payments` table. Points back at its order by id only; the order never
/// embeds payment state.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Decimal,

    /// Provider-side payment id, once known
    pub external_payment_id: Option<String>,
    /// Provider-side checkout preference id
    pub external_preference_id: Option<String>,
    /// Hosted checkout URL for redirect methods
    pub checkout_url: Option<String>,

    /// PIX copy-and-paste payload
    pub qr_code: Option<String>,
    /// PIX QR image, base64 PNG
    pub qr_code_base64: Option<String>,
    /// Provider ticket / receipt URL
    pub ticket_url: Option<String>,

    /// Last raw provider response, kept verbatim for audit
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub external_response: Option<Json>,
    pub failure_reason: Option<String>,

    pub paid_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency stamp, bumped on every mutation.
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a new pending payment for an order.
    pub fn new(order_id: Uuid, method: PaymentMethod, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            method,
            status: PaymentStatus::Pending,
            amount,
            external_payment_id: None,
            external_preference_id: None,
            checkout_url: None,
            qr_code: None,
            qr_code_base64: None,
            ticket_url: None,
            external_response: None,
            failure_reason: None,
            paid_at: None,
            expired_at: None,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    fn invalid_transition(&self, target: &str) -> ServiceError {
        ServiceError::InvalidStatus(format!(
            "payment {} cannot move to {} from status {}",
            self.id, target, self.status
        ))
    }

    /// PENDING -> PROCESSING, once the provider has accepted the attempt.
    pub fn mark_as_processing(&mut self) -> Result<(), ServiceError> {
        if self.status != PaymentStatus::Pending {
            return Err(self.invalid_transition("PROCESSING"));
        }
        self.status = PaymentStatus::Processing;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Records the PIX artifacts returned by the provider. Only meaningful
    /// for PIX payments.
    pub fn set_pix_data(
        &mut self,
        qr_code: Option<String>,
        qr_code_base64: Option<String>,
        ticket_url: Option<String>,
    ) -> Result<(), ServiceError> {
        if self.method != PaymentMethod::Pix {
            return Err(ServiceError::InvalidOperation(format!(
                "payment {} is not a PIX payment",
                self.id
            )));
        }
        self.qr_code = qr_code;
        self.qr_code_base64 = qr_code_base64;
        self.ticket_url = ticket_url;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING/PROCESSING -> APPROVED. Stamps paid_at.
    pub fn approve(&mut self) -> Result<(), ServiceError> {
        if !self.status.is_active() {
            return Err(self.invalid_transition("APPROVED"));
        }
        self.status = PaymentStatus::Approved;
        self.paid_at = Some(Utc::now());
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING/PROCESSING -> REJECTED. Approved payments can never be
    /// rejected after the fact.
    pub fn reject(&mut self, reason: Option<String>) -> Result<(), ServiceError> {
        if !self.status.is_active() {
            return Err(self.invalid_transition("REJECTED"));
        }
        self.status = PaymentStatus::Rejected;
        self.failure_reason = reason;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING/PROCESSING -> CANCELLED.
    pub fn cancel(&mut self, reason: Option<String>) -> Result<(), ServiceError> {
        if !self.status.is_active() {
            return Err(self.invalid_transition("CANCELLED"));
        }
        self.status = PaymentStatus::Cancelled;
        self.failure_reason = reason;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING/PROCESSING -> EXPIRED. Stamps expired_at.
    pub fn expire(&mut self) -> Result<(), ServiceError> {
        if !self.status.is_active() {
            return Err(self.invalid_transition("EXPIRED"));
        }
        self.status = PaymentStatus::Expired;
        self.expired_at = Some(Utc::now());
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// A new attempt may be created after a rejection or expiration.
    pub fn can_be_retried(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Rejected | PaymentStatus::Expired
        )
    }

    /// Keeps the latest raw provider snapshot, whatever the outcome.
    pub fn update_external_response(&mut self, response: Json) {
        self.external_response = Some(response);
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pix_payment() -> Model {
        Model::new(Uuid::new_v4(), PaymentMethod::Pix, dec!(75.00))
    }

    #[test]
    fn new_payment_starts_pending() {
        let payment = pix_payment();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.status.is_active());
        assert!(payment.paid_at.is_none());
    }

    #[test]
    fn approve_from_pending_and_processing() {
        let mut payment = pix_payment();
        payment.approve().unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
        assert!(payment.paid_at.is_some());

        let mut payment = pix_payment();
        payment.mark_as_processing().unwrap();
        payment.approve().unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
    }

    #[test]
    fn duplicate_approve_is_an_error() {
        let mut payment = pix_payment();
        payment.approve().unwrap();
        let paid_at = payment.paid_at;
        let err = payment.approve().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatus(_)));
        assert_eq!(payment.paid_at, paid_at);
    }

    #[test]
    fn approved_payment_cannot_be_rejected_or_cancelled() {
        let mut payment = pix_payment();
        payment.approve().unwrap();
        assert!(payment.reject(Some("late webhook".into())).is_err());
        assert!(payment.cancel(None).is_err());
        assert!(payment.expire().is_err());
        assert_eq!(payment.status, PaymentStatus::Approved);
    }

    #[test]
    fn mark_as_processing_only_from_pending() {
        let mut payment = pix_payment();
        payment.mark_as_processing().unwrap();
        assert!(payment.mark_as_processing().is_err());
    }

    #[test]
    fn pix_data_rejected_for_card_payments() {
        let mut payment = Model::new(Uuid::new_v4(), PaymentMethod::CreditCard, dec!(10.00));
        let err = payment
            .set_pix_data(Some("payload".into()), None, None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOperation(_)));
    }

    #[test]
    fn retry_allowed_after_rejection_or_expiry() {
        let mut payment = pix_payment();
        payment.reject(Some("Rejeitado pelo provedor".into())).unwrap();
        assert!(payment.can_be_retried());

        let mut payment = pix_payment();
        payment.expire().unwrap();
        assert!(payment.can_be_retried());
        assert!(payment.expired_at.is_some());

        let mut payment = pix_payment();
        payment.approve().unwrap();
        assert!(!payment.can_be_retried());
    }

    #[test]
    fn cash_does_not_require_external_processing() {
        assert!(!PaymentMethod::Cash.requires_external_processing());
        assert!(PaymentMethod::Pix.requires_external_processing());
        assert!(PaymentMethod::CreditCard.requires_external_processing());
    }
}
