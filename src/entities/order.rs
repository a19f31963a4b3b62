use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Enum representing the possible statuses of an order.
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
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "IN_PREPARATION")]
    InPreparation,
    #[sea_orm(string_value = "READY")]
    Ready,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    /// Single transition table for the order lifecycle. New transitions are
    /// additions here, not scattered conditionals.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InPreparation)
                | (Confirmed, Cancelled)
                | (InPreparation, Ready)
                | (Ready, Delivered)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn can_be_cancelled(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Confirmed)
    }
}

/// Contact details for orders placed without a registered customer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GuestContact {
    #[validate(length(min = 1, message = "Guest name is required"))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// The `orders` table.
///
/// Ownership is one-directional: the order holds an optional customer id and
/// owns its items; payments point back at the order by id only.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Registered customer, if any. Guest orders leave this NULL and carry
    /// the structured contact fields below instead.
    pub customer_id: Option<Uuid>,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,

    pub status: OrderStatus,

    /// Derived: always the sum of item totals while the order is PENDING.
    /// Frozen once the status leaves PENDING.
    pub total: Decimal,

    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency stamp, bumped on every mutation.
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a new pending order for a registered customer.
    pub fn new_for_customer(customer_id: Uuid, notes: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: Some(customer_id),
            guest_name: None,
            guest_email: None,
            guest_phone: None,
            status: OrderStatus::Pending,
            total: Decimal::ZERO,
            notes,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    /// Creates a new pending guest order with structured contact data.
    pub fn new_for_guest(contact: GuestContact, notes: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: None,
            guest_name: Some(contact.name),
            guest_email: contact.email,
            guest_phone: contact.phone,
            status: OrderStatus::Pending,
            total: Decimal::ZERO,
            notes,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    pub fn has_registered_customer(&self) -> bool {
        self.customer_id.is_some()
    }

    /// Email to forward to the payment gateway, if known.
    pub fn contact_email(&self) -> Option<&str> {
        self.guest_email.as_deref()
    }

    pub fn can_be_modified(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// Guard shared by every item mutation: only PENDING orders may change.
    pub fn ensure_modifiable(&self) -> Result<(), ServiceError> {
        if self.can_be_modified() {
            Ok(())
        } else {
            Err(ServiceError::InvalidStatus(format!(
                "order {} cannot be modified in status {}",
                self.id, self.status
            )))
        }
    }

    /// Applies a lifecycle transition, validated against the transition table.
    pub fn update_status(&mut self, new_status: OrderStatus) -> Result<(), ServiceError> {
        if !self.status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "invalid order status transition: {} -> {}",
                self.status, new_status
            )));
        }
        self.status = new_status;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Cancels the order, recording the reason in the notes field.
    pub fn cancel(&mut self, reason: Option<&str>) -> Result<(), ServiceError> {
        if !self.status.can_be_cancelled() {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} cannot be cancelled in status {}",
                self.id, self.status
            )));
        }
        self.status = OrderStatus::Cancelled;
        let note = format!("CANCELADO: {}", reason.unwrap_or("Sem motivo informado"));
        self.notes = match self.notes.take() {
            Some(existing) => Some(format!("{} | {}", existing, note)),
            None => Some(note),
        };
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Recomputes the derived total from the order's items.
    pub fn set_total(&mut self, total: Decimal) {
        self.total = total;
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pending_order() -> Model {
        Model::new_for_customer(Uuid::new_v4(), None)
    }

    #[test]
    fn new_order_starts_pending_with_zero_total() {
        let order = pending_order();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total, Decimal::ZERO);
        assert_eq!(order.version, 1);
        assert!(order.has_registered_customer());
    }

    #[test]
    fn guest_order_carries_structured_contact() {
        let order = Model::new_for_guest(
            GuestContact {
                name: "João da Silva".into(),
                email: Some("joao@example.com".into()),
                phone: Some("+55 11 99999-0000".into()),
            },
            None,
        );
        assert!(!order.has_registered_customer());
        assert_eq!(order.guest_name.as_deref(), Some("João da Silva"));
        assert_eq!(order.contact_email(), Some("joao@example.com"));
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut order = pending_order();
        for status in [
            OrderStatus::Confirmed,
            OrderStatus::InPreparation,
            OrderStatus::Ready,
            OrderStatus::Delivered,
        ] {
            order.update_status(status).unwrap();
            assert_eq!(order.status, status);
        }
        assert!(order.status.is_terminal());
    }

    #[test]
    fn illegal_transitions_fail_and_leave_status_unchanged() {
        let illegal = [
            (OrderStatus::Pending, OrderStatus::InPreparation),
            (OrderStatus::Pending, OrderStatus::Ready),
            (OrderStatus::Pending, OrderStatus::Delivered),
            (OrderStatus::Confirmed, OrderStatus::Ready),
            (OrderStatus::Confirmed, OrderStatus::Delivered),
            (OrderStatus::InPreparation, OrderStatus::Cancelled),
            (OrderStatus::Ready, OrderStatus::Cancelled),
            (OrderStatus::Delivered, OrderStatus::Pending),
            (OrderStatus::Cancelled, OrderStatus::Confirmed),
        ];
        for (from, to) in illegal {
            let mut order = pending_order();
            order.status = from;
            let err = order.update_status(to).unwrap_err();
            assert!(matches!(err, ServiceError::InvalidStatus(_)));
            assert_eq!(order.status, from, "{} -> {} must not apply", from, to);
        }
    }

    #[test]
    fn cancel_appends_reason_to_notes() {
        let mut order = pending_order();
        order.notes = Some("mesa 12".into());
        order.cancel(Some("cliente desistiu")).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(
            order.notes.as_deref(),
            Some("mesa 12 | CANCELADO: cliente desistiu")
        );
    }

    #[test]
    fn cancel_is_only_allowed_from_pending_or_confirmed() {
        let mut order = pending_order();
        order.status = OrderStatus::InPreparation;
        assert!(order.cancel(None).is_err());
        assert_eq!(order.status, OrderStatus::InPreparation);

        let mut order = pending_order();
        order.update_status(OrderStatus::Confirmed).unwrap();
        order.cancel(None).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn item_mutations_are_rejected_outside_pending() {
        let mut order = pending_order();
        assert!(order.ensure_modifiable().is_ok());
        order.update_status(OrderStatus::Confirmed).unwrap();
        let err = order.ensure_modifiable().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatus(_)));
    }

    #[test]
    fn set_total_updates_timestamp() {
        let mut order = pending_order();
        order.set_total(dec!(75.00));
        assert_eq!(order.total, dec!(75.00));
        assert!(order.updated_at.is_some());
    }
}
