use chrono::{DateTime, Utc};
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
pub enum TransactionType {
    #[sea_orm(string_value = "EARNED")]
    Earned,
    #[sea_orm(string_value = "REDEEMED")]
    Redeemed,
    #[sea_orm(string_value = "BONUS")]
    Bonus,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
    #[sea_orm(string_value = "ADJUSTMENT")]
    Adjustment,
}

impl TransactionType {
    /// Whether this entry credits (+) or debits (-) the spendable balance.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Earned | TransactionType::Bonus | TransactionType::Adjustment
        )
    }
}

/// The `loyalty_transactions` table: the append-only ledger. Every balance
/// mutation writes one row carrying the balance before and after, so the
/// history replays to the current balance.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "loyalty_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub loyalty_program_id: Uuid,
    pub order_id: Option<Uuid>,
    pub transaction_type: TransactionType,

    /// Always positive; direction comes from the type.
    pub points: i32,
    pub balance_before: i32,
    pub balance_after: i32,

    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::loyalty_program::Entity",
        from = "Column::LoyaltyProgramId",
        to = "super::loyalty_program::Column::Id"
    )]
    LoyaltyProgram,
}

impl Related<super::loyalty_program::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LoyaltyProgram.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Builds a ledger entry. `balance_before` is the spendable balance
    /// captured before the program row was mutated.
    pub fn new(
        loyalty_program_id: Uuid,
        order_id: Option<Uuid>,
        transaction_type: TransactionType,
        points: i32,
        balance_before: i32,
        description: Option<String>,
    ) -> Self {
        let balance_after = if transaction_type.is_credit() {
            balance_before + points
        } else {
            balance_before - points
        };
        Self {
            id: Uuid::new_v4(),
            loyalty_program_id,
            order_id,
            transaction_type,
            points,
            balance_before,
            balance_after,
            description,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_entry_computes_balance_after() {
        let entry = Model::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            TransactionType::Earned,
            1000,
            0,
            None,
        );
        assert_eq!(entry.balance_before, 0);
        assert_eq!(entry.balance_after, 1000);
    }

    #[test]
    fn debit_entry_computes_balance_after() {
        let entry = Model::new(
            Uuid::new_v4(),
            None,
            TransactionType::Redeemed,
            400,
            1000,
            Some("resgate".into()),
        );
        assert_eq!(entry.balance_before, 1000);
        assert_eq!(entry.balance_after, 600);
    }

    #[test]
    fn bonus_and_adjustment_are_credits() {
        assert!(TransactionType::Bonus.is_credit());
        assert!(TransactionType::Adjustment.is_credit());
        assert!(!TransactionType::Redeemed.is_credit());
        assert!(!TransactionType::Expired.is_credit());
    }
}
