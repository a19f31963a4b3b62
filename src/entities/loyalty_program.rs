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
    PartialOrd,
    Ord,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LoyaltyTier {
    #[sea_orm(string_value = "BRONZE")]
    Bronze,
    #[sea_orm(string_value = "SILVER")]
    Silver,
    #[sea_orm(string_value = "GOLD")]
    Gold,
    #[sea_orm(string_value = "DIAMOND")]
    Diamond,
}

impl LoyaltyTier {
    /// Percentage discount applied to order totals for this tier.
    pub fn discount_percentage(&self) -> Decimal {
        match self {
            LoyaltyTier::Bronze => Decimal::ZERO,
            LoyaltyTier::Silver => Decimal::from(5),
            LoyaltyTier::Gold => Decimal::from(10),
            LoyaltyTier::Diamond => Decimal::from(15),
        }
    }

    /// Multiplier applied to base points when earning.
    pub fn points_multiplier(&self) -> i32 {
        match self {
            LoyaltyTier::Bronze => 1,
            LoyaltyTier::Silver => 2,
            LoyaltyTier::Gold => 3,
            LoyaltyTier::Diamond => 4,
        }
    }

    /// Tier a member qualifies for, from lifetime points or lifetime spend,
    /// whichever reaches a threshold first.
    pub fn for_totals(total_points: i32, total_spent: Decimal) -> Self {
        let qualifier = std::cmp::max(
            Decimal::from(total_points),
            total_spent,
        );
        if qualifier >= Decimal::from(5000) {
            LoyaltyTier::Diamond
        } else if qualifier >= Decimal::from(2500) {
            LoyaltyTier::Gold
        } else if qualifier >= Decimal::from(1000) {
            LoyaltyTier::Silver
        } else {
            LoyaltyTier::Bronze
        }
    }
}

/// The `loyalty_programs` table: one row per member, tracking the spendable
/// balance, lifetime totals and the current tier.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "loyalty_programs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub user_id: Uuid,

    /// Spendable balance; always total_points - used_points
    pub available_points: i32,
    /// Lifetime earned points, never reduced by redemption
    pub total_points: i32,
    /// Lifetime redeemed points
    pub used_points: i32,
    /// Lifetime spend across counted orders
    pub total_spent: Decimal,
    /// Number of counted orders
    pub order_count: i32,

    pub tier: LoyaltyTier,
    /// When the member last moved up a tier
    pub tier_upgrade_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency stamp, bumped on every mutation.
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::loyalty_transaction::Entity")]
    Transactions,
}

impl Related<super::loyalty_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a fresh BRONZE program for a member.
    pub fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            available_points: 0,
            total_points: 0,
            used_points: 0,
            total_spent: Decimal::ZERO,
            order_count: 0,
            tier: LoyaltyTier::Bronze,
            tier_upgrade_at: None,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    /// Credits points to the member. When `counts_as_order` is set, the order
    /// value and count also feed the lifetime totals; bonus credits pass
    /// `false` and zero. Tier is re-evaluated afterwards and never regresses.
    pub fn add_points(&mut self, points: i32, order_value: Decimal, counts_as_order: bool) {
        self.available_points += points;
        self.total_points += points;
        if counts_as_order {
            self.total_spent += order_value;
            self.order_count += 1;
        }

        let qualified = LoyaltyTier::for_totals(self.total_points, self.total_spent);
        if qualified > self.tier {
            self.tier = qualified;
            self.tier_upgrade_at = Some(Utc::now());
        }
        self.updated_at = Some(Utc::now());
    }

    /// Debits spendable points. Lifetime totals and tier are untouched.
    pub fn use_points(&mut self, points: i32) -> Result<(), ServiceError> {
        if points <= 0 {
            return Err(ServiceError::InvalidInput(
                "points to redeem must be positive".into(),
            ));
        }
        if points > self.available_points {
            return Err(ServiceError::InsufficientPoints {
                requested: points,
                available: self.available_points,
            });
        }
        self.available_points -= points;
        self.used_points += points;
        self.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tier_thresholds_use_the_higher_of_points_and_spend() {
        assert_eq!(LoyaltyTier::for_totals(0, dec!(0)), LoyaltyTier::Bronze);
        assert_eq!(LoyaltyTier::for_totals(999, dec!(999.99)), LoyaltyTier::Bronze);
        assert_eq!(LoyaltyTier::for_totals(1000, dec!(0)), LoyaltyTier::Silver);
        assert_eq!(LoyaltyTier::for_totals(0, dec!(2500)), LoyaltyTier::Gold);
        assert_eq!(LoyaltyTier::for_totals(5000, dec!(100)), LoyaltyTier::Diamond);
    }

    #[test]
    fn earning_counts_order_and_may_upgrade_tier() {
        let mut program = Model::new(Uuid::new_v4());
        program.add_points(1000, dec!(100.00), true);
        assert_eq!(program.available_points, 1000);
        assert_eq!(program.total_points, 1000);
        assert_eq!(program.total_spent, dec!(100.00));
        assert_eq!(program.order_count, 1);
        assert_eq!(program.tier, LoyaltyTier::Silver);
        assert!(program.tier_upgrade_at.is_some());
    }

    #[test]
    fn bonus_credit_leaves_order_totals_alone() {
        let mut program = Model::new(Uuid::new_v4());
        program.add_points(500, Decimal::ZERO, false);
        assert_eq!(program.available_points, 500);
        assert_eq!(program.total_points, 500);
        assert_eq!(program.order_count, 0);
        assert_eq!(program.total_spent, Decimal::ZERO);
    }

    #[test]
    fn tier_never_regresses() {
        let mut program = Model::new(Uuid::new_v4());
        program.tier = LoyaltyTier::Gold;
        program.add_points(10, dec!(1.00), true);
        assert_eq!(program.tier, LoyaltyTier::Gold);
    }

    #[test]
    fn redemption_debits_balance_but_not_lifetime_totals() {
        let mut program = Model::new(Uuid::new_v4());
        program.add_points(1000, dec!(100.00), true);
        program.use_points(400).unwrap();
        assert_eq!(program.available_points, 600);
        assert_eq!(program.used_points, 400);
        assert_eq!(program.total_points, 1000);
        assert_eq!(
            program.available_points,
            program.total_points - program.used_points
        );
        assert_eq!(program.tier, LoyaltyTier::Silver);
    }

    #[test]
    fn overdraw_is_rejected_with_balances() {
        let mut program = Model::new(Uuid::new_v4());
        program.add_points(100, dec!(10.00), true);
        let err = program.use_points(200).unwrap_err();
        match err {
            ServiceError::InsufficientPoints { requested, available } => {
                assert_eq!(requested, 200);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(program.available_points, 100);
    }
}
