use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `order_items` table. Each line snapshots the menu item's name and
/// price at the moment it was added, so later catalog edits never change
/// what the customer agreed to pay.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub menu_item_id: Uuid,

    /// Name snapshot captured at add time
    pub name: String,
    pub quantity: i32,

    /// Price snapshot captured at add time
    pub unit_price: Decimal,

    /// Derived: unit_price * quantity
    pub total_price: Decimal,

    pub observations: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
    #[sea_orm(
        belongs_to = "super::menu_item::Entity",
        from = "Column::MenuItemId",
        to = "super::menu_item::Column::Id"
    )]
    MenuItem,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::menu_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MenuItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a new line for an order, snapshotting the catalog item.
    pub fn new(
        order_id: Uuid,
        menu_item: &super::menu_item::Model,
        quantity: i32,
        observations: Option<String>,
    ) -> Result<Self, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "item quantity must be positive".into(),
            ));
        }
        let unit_price = menu_item.price;
        Ok(Self {
            id: Uuid::new_v4(),
            order_id,
            menu_item_id: menu_item.id,
            name: menu_item.name.clone(),
            quantity,
            unit_price,
            total_price: unit_price * Decimal::from(quantity),
            observations,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    /// Replaces the quantity and recomputes the line total.
    pub fn set_quantity(&mut self, quantity: i32) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "item quantity must be positive".into(),
            ));
        }
        self.quantity = quantity;
        self.total_price = self.unit_price * Decimal::from(quantity);
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Adds to the existing quantity; used when the same item is added again.
    pub fn add_quantity(&mut self, additional: i32) -> Result<(), ServiceError> {
        if additional <= 0 {
            return Err(ServiceError::InvalidInput(
                "item quantity must be positive".into(),
            ));
        }
        self.set_quantity(self.quantity + additional)
    }

    /// Concatenates a new observation onto the existing one.
    pub fn append_observation(&mut self, observation: &str) {
        let observation = observation.trim();
        if observation.is_empty() {
            return;
        }
        self.observations = match self.observations.take() {
            Some(existing) if !existing.is_empty() => {
                Some(format!("{} | {}", existing, observation))
            }
            _ => Some(observation.to_string()),
        };
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn picanha() -> super::super::menu_item::Model {
        super::super::menu_item::Model {
            id: Uuid::new_v4(),
            name: "Picanha".into(),
            description: None,
            price: dec!(25.00),
            category: Some("Churrasco".into()),
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn new_line_snapshots_name_and_price() {
        let item = picanha();
        let line = Model::new(Uuid::new_v4(), &item, 2, None).unwrap();
        assert_eq!(line.name, "Picanha");
        assert_eq!(line.unit_price, dec!(25.00));
        assert_eq!(line.total_price, dec!(50.00));
    }

    #[test]
    fn zero_or_negative_quantity_is_rejected() {
        let item = picanha();
        assert!(Model::new(Uuid::new_v4(), &item, 0, None).is_err());
        assert!(Model::new(Uuid::new_v4(), &item, -1, None).is_err());
    }

    #[test]
    fn add_quantity_recomputes_total() {
        let item = picanha();
        let mut line = Model::new(Uuid::new_v4(), &item, 2, None).unwrap();
        line.add_quantity(1).unwrap();
        assert_eq!(line.quantity, 3);
        assert_eq!(line.total_price, dec!(75.00));
    }

    #[test]
    fn observations_are_concatenated() {
        let item = picanha();
        let mut line =
            Model::new(Uuid::new_v4(), &item, 1, Some("mal passada".into())).unwrap();
        line.append_observation("sem sal");
        assert_eq!(line.observations.as_deref(), Some("mal passada | sem sal"));
        line.append_observation("   ");
        assert_eq!(line.observations.as_deref(), Some("mal passada | sem sal"));
    }
}
