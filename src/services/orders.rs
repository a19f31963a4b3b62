use crate::{
    db::DbPool,
    entities::menu_item::Entity as MenuItemEntity,
    entities::order::{self, Entity as OrderEntity, GuestContact, OrderStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{outbox, Event, EventSender},
};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGuestOrderRequest {
    #[validate(length(min = 1, message = "Guest name is required"))]
    pub guest_name: String,
    #[validate(email)]
    pub guest_email: Option<String>,
    pub guest_phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    pub menu_item_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub observations: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateItemQuantityRequest {
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

/// An order with its lines, as returned to callers.
#[derive(Debug, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Sum of line totals; the order total is always derived from this while
/// the order is open.
pub fn total_of(items: &[order_item::Model]) -> Decimal {
    items.iter().map(|item| item.total_price).sum()
}

/// Persists an order using its version stamp as the optimistic guard.
/// Zero rows affected means another writer got there first.
async fn persist_order<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
) -> Result<order::Model, ServiceError> {
    let id = order.id;
    let guard_version = order.version;
    let mut updated = order;
    updated.version += 1;

    let result = OrderEntity::update_many()
        .set(updated.clone().into_active_model().reset_all())
        .filter(order::Column::Id.eq(id))
        .filter(order::Column::Version.eq(guard_version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(order_id = %id, "order was modified concurrently");
        return Err(ServiceError::ConcurrentModification(id));
    }
    Ok(updated)
}

/// Service for managing the order lifecycle and its lines.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
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

    /// Creates a new pending order for a registered customer.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn create_order_for_user(
        &self,
        request: CreateOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        request.validate()?;
        let order = order::Model::new_for_customer(request.customer_id, request.notes);
        self.insert_order(order).await
    }

    /// Creates a new pending order for a walk-in guest.
    #[instrument(skip(self, request), fields(guest_name = %request.guest_name))]
    pub async fn create_guest_order(
        &self,
        request: CreateGuestOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        request.validate()?;
        let contact = GuestContact {
            name: request.guest_name,
            email: request.guest_email,
            phone: request.guest_phone,
        };
        let order = order::Model::new_for_guest(contact, request.notes);
        self.insert_order(order).await
    }

    async fn insert_order(&self, order: order::Model) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let order_id = order.id;

        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let model = order
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to create order");
                ServiceError::db_error(e)
            })?;
        outbox::enqueue(&txn, "order", Some(order_id), &Event::OrderCreated(order_id)).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, "Order created");
        self.emit(Event::OrderCreated(order_id)).await;
        Ok(model)
    }

    /// Retrieves an order with its lines.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = self.load_items(db, order_id).await?;
        Ok(OrderDetails { order, items })
    }

    async fn load_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn load_order_for_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    /// Adds an item to an open order. Adding a menu item that is already on
    /// the order merges into the existing line instead of creating another.
    #[instrument(skip(self, request), fields(order_id = %order_id, menu_item_id = %request.menu_item_id))]
    pub async fn add_item(
        &self,
        order_id: Uuid,
        request: AddItemRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request.validate()?;
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = self.load_order_for_update(&txn, order_id).await?;
        order.ensure_modifiable()?;

        let menu_item = MenuItemEntity::find_by_id(request.menu_item_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Menu item {} not found", request.menu_item_id))
            })?;
        if !menu_item.active {
            return Err(ServiceError::InvalidOperation(format!(
                "Menu item {} is not available",
                menu_item.name
            )));
        }

        let existing = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::MenuItemId.eq(menu_item.id))
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        match existing {
            Some(mut line) => {
                line.add_quantity(request.quantity)?;
                if let Some(obs) = request.observations.as_deref() {
                    line.append_observation(obs);
                }
                line.into_active_model()
                    .reset_all()
                    .update(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
            None => {
                let line = order_item::Model::new(
                    order_id,
                    &menu_item,
                    request.quantity,
                    request.observations,
                )?;
                line.into_active_model()
                    .reset_all()
                    .insert(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
        }

        let details = self.recompute_total(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(order_id = %order_id, total = %details.order.total, "Item added to order");
        Ok(details)
    }

    /// Removes a line from an open order.
    #[instrument(skip(self), fields(order_id = %order_id, item_id = %item_id))]
    pub async fn remove_item(
        &self,
        order_id: Uuid,
        item_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = self.load_order_for_update(&txn, order_id).await?;
        order.ensure_modifiable()?;

        let line = self.load_line(&txn, order_id, item_id).await?;
        OrderItemEntity::delete_by_id(line.id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let details = self.recompute_total(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        info!(order_id = %order_id, item_id = %item_id, "Item removed from order");
        Ok(details)
    }

    /// Replaces a line's quantity on an open order.
    #[instrument(skip(self, request), fields(order_id = %order_id, item_id = %item_id))]
    pub async fn update_item_quantity(
        &self,
        order_id: Uuid,
        item_id: Uuid,
        request: UpdateItemQuantityRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request.validate()?;
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let order = self.load_order_for_update(&txn, order_id).await?;
        order.ensure_modifiable()?;

        let mut line = self.load_line(&txn, order_id, item_id).await?;
        line.set_quantity(request.quantity)?;
        line.into_active_model()
            .reset_all()
            .update(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let details = self.recompute_total(&txn, order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(details)
    }

    async fn load_line<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        item_id: Uuid,
    ) -> Result<order_item::Model, ServiceError> {
        let line = OrderItemEntity::find_by_id(item_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))?;
        if line.order_id != order_id {
            return Err(ServiceError::NotFound(format!(
                "Order item {} does not belong to order {}",
                item_id, order_id
            )));
        }
        Ok(line)
    }

    async fn recompute_total<C: ConnectionTrait>(
        &self,
        conn: &C,
        mut order: order::Model,
    ) -> Result<OrderDetails, ServiceError> {
        let items = self.load_items(conn, order.id).await?;
        order.set_total(total_of(&items));
        let order = persist_order(conn, order).await?;
        Ok(OrderDetails { order, items })
    }

    /// Applies a lifecycle transition to an order.
    #[instrument(skip(self, request), fields(order_id = %order_id, new_status = %request.status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        request: UpdateOrderStatusRequest,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut order = self.load_order_for_update(&txn, order_id).await?;
        let old_status = order.status;
        order.update_status(request.status)?;
        let order = persist_order(&txn, order).await?;

        let event = Event::OrderStatusChanged {
            order_id,
            old_status: old_status.to_string(),
            new_status: order.status.to_string(),
        };
        outbox::enqueue(&txn, "order", Some(order_id), &event).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, old_status = %old_status, new_status = %order.status, "Order status updated");
        self.emit(event).await;
        Ok(order)
    }

    /// Cancels an order, recording the reason.
    #[instrument(skip(self, request), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        request: CancelOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut order = self.load_order_for_update(&txn, order_id).await?;
        order.cancel(request.reason.as_deref())?;
        let order = persist_order(&txn, order).await?;

        outbox::enqueue(&txn, "order", Some(order_id), &Event::OrderCancelled(order_id)).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, "Order cancelled");
        self.emit(Event::OrderCancelled(order_id)).await;
        Ok(order)
    }

    /// Lists a customer's orders, newest first.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn list_orders_for_customer(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<order::Model>, ServiceError> {
        let db = &*self.db_pool;
        OrderEntity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::menu_item;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn menu_item(name: &str, price: Decimal) -> menu_item::Model {
        menu_item::Model {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            price,
            category: None,
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn total_is_the_sum_of_line_totals() {
        let order_id = Uuid::new_v4();
        let picanha = menu_item("Picanha", dec!(25.00));
        let refri = menu_item("Refrigerante", dec!(6.50));

        let lines = vec![
            order_item::Model::new(order_id, &picanha, 2, None).unwrap(),
            order_item::Model::new(order_id, &refri, 1, None).unwrap(),
        ];
        assert_eq!(total_of(&lines), dec!(56.50));
    }

    #[test]
    fn merging_the_same_item_grows_one_line() {
        let order_id = Uuid::new_v4();
        let picanha = menu_item("Picanha", dec!(25.00));

        let mut line = order_item::Model::new(order_id, &picanha, 2, None).unwrap();
        assert_eq!(total_of(std::slice::from_ref(&line)), dec!(50.00));

        line.add_quantity(1).unwrap();
        assert_eq!(line.quantity, 3);
        assert_eq!(total_of(std::slice::from_ref(&line)), dec!(75.00));
    }

    #[test]
    fn empty_order_totals_zero() {
        assert_eq!(total_of(&[]), Decimal::ZERO);
    }
}
