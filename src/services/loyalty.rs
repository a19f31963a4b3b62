use crate::{
    db::DbPool,
    entities::loyalty_program::{self, Entity as LoyaltyProgramEntity},
    entities::loyalty_transaction::{self, Entity as LoyaltyTransactionEntity, TransactionType},
    errors::ServiceError,
    events::{outbox, Event, EventSender},
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Fixed accrual rate: 10 points per unit of currency spent.
pub const POINTS_PER_CURRENCY_UNIT: i32 = 10;

/// Base points for an order total: floor(total * rate). Fractions of a point
/// are never credited.
pub fn base_points_for(order_total: Decimal) -> i32 {
    (order_total * Decimal::from(POINTS_PER_CURRENCY_UNIT))
        .floor()
        .to_i32()
        .unwrap_or(0)
        .max(0)
}

/// Discount amount for a tier, rounded half-up to cents.
pub fn discount_for(tier: loyalty_program::LoyaltyTier, amount: Decimal) -> Decimal {
    (amount * tier.discount_percentage() / Decimal::from(100))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

async fn persist_program<C: ConnectionTrait>(
    conn: &C,
    program: loyalty_program::Model,
) -> Result<loyalty_program::Model, ServiceError> {
    let id = program.id;
    let guard_version = program.version;
    let mut updated = program;
    updated.version += 1;

    let result = LoyaltyProgramEntity::update_many()
        .set(updated.clone().into_active_model().reset_all())
        .filter(loyalty_program::Column::Id.eq(id))
        .filter(loyalty_program::Column::Version.eq(guard_version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 0 {
        warn!(program_id = %id, "loyalty program was modified concurrently");
        return Err(ServiceError::ConcurrentModification(id));
    }
    Ok(updated)
}

/// Service for the loyalty ledger: accrual, redemption and tier-derived
/// discounts.
#[derive(Clone)]
pub struct LoyaltyService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl LoyaltyService {
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

    /// Fetches the member's program, creating a BRONZE one on first use.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_or_create_program(
        &self,
        user_id: Uuid,
    ) -> Result<loyalty_program::Model, ServiceError> {
        let db = &*self.db_pool;
        self.get_or_create_program_on(db, user_id).await
    }

    async fn get_or_create_program_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
    ) -> Result<loyalty_program::Model, ServiceError> {
        let existing = LoyaltyProgramEntity::find()
            .filter(loyalty_program::Column::UserId.eq(user_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(program) = existing {
            return Ok(program);
        }

        let program = loyalty_program::Model::new(user_id);
        program
            .clone()
            .into_active_model()
            .reset_all()
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
        info!(user_id = %user_id, "Loyalty program created");
        Ok(program)
    }

    /// Credits points for a paid order. The multiplier comes from the tier
    /// the member held *before* this accrual; the tier is then re-evaluated.
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id, order_total = %order_total))]
    pub async fn earn_points(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        order_total: Decimal,
    ) -> Result<loyalty_transaction::Model, ServiceError> {
        let base = base_points_for(order_total);
        if base <= 0 {
            return Err(ServiceError::ValidationError(
                "Order total yields no points".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut program = self.get_or_create_program_on(&txn, user_id).await?;
        let multiplier = program.tier.points_multiplier();
        let earned = base * multiplier;
        let balance_before = program.available_points;

        program.add_points(earned, order_total, true);
        let program = persist_program(&txn, program).await?;

        let entry = loyalty_transaction::Model::new(
            program.id,
            Some(order_id),
            TransactionType::Earned,
            earned,
            balance_before,
            Some(format!("Pedido #{} - {} pontos (x{})", order_id, earned, multiplier)),
        );
        entry
            .clone()
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let event = Event::LoyaltyPointsEarned {
            user_id,
            order_id,
            points: earned,
        };
        outbox::enqueue(&txn, "loyalty_program", Some(program.id), &event).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            user_id = %user_id,
            order_id = %order_id,
            points = earned,
            tier = %program.tier,
            "Loyalty points earned"
        );
        self.emit(event).await;
        Ok(entry)
    }

    /// Debits spendable points, failing when the balance is insufficient.
    #[instrument(skip(self), fields(user_id = %user_id, points = points))]
    pub async fn redeem_points(
        &self,
        user_id: Uuid,
        points: i32,
        description: Option<String>,
    ) -> Result<loyalty_transaction::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut program = self.get_or_create_program_on(&txn, user_id).await?;
        let balance_before = program.available_points;
        program.use_points(points)?;
        let program = persist_program(&txn, program).await?;

        let entry = loyalty_transaction::Model::new(
            program.id,
            None,
            TransactionType::Redeemed,
            points,
            balance_before,
            description,
        );
        entry
            .clone()
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let event = Event::LoyaltyPointsRedeemed { user_id, points };
        outbox::enqueue(&txn, "loyalty_program", Some(program.id), &event).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(user_id = %user_id, points = points, "Loyalty points redeemed");
        self.emit(event).await;
        Ok(entry)
    }

    /// Credits promotional points. Does not count as an order: spend and
    /// order count stay put, so bonuses alone cannot advance the tier by
    /// spend even though the points still do.
    #[instrument(skip(self, description), fields(user_id = %user_id, points = points))]
    pub async fn add_bonus_points(
        &self,
        user_id: Uuid,
        points: i32,
        description: Option<String>,
    ) -> Result<loyalty_transaction::Model, ServiceError> {
        if points <= 0 {
            return Err(ServiceError::InvalidInput(
                "bonus points must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let mut program = self.get_or_create_program_on(&txn, user_id).await?;
        let balance_before = program.available_points;
        program.add_points(points, Decimal::ZERO, false);
        let program = persist_program(&txn, program).await?;

        let entry = loyalty_transaction::Model::new(
            program.id,
            None,
            TransactionType::Bonus,
            points,
            balance_before,
            description,
        );
        entry
            .clone()
            .into_active_model()
            .reset_all()
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(user_id = %user_id, points = points, "Bonus points credited");
        Ok(entry)
    }

    /// Ledger history for a member, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_transactions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<loyalty_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        let program = self.get_or_create_program(user_id).await?;
        LoyaltyTransactionEntity::find()
            .filter(loyalty_transaction::Column::LoyaltyProgramId.eq(program.id))
            .order_by_desc(loyalty_transaction::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Discount amount the member's tier grants on the given total.
    #[instrument(skip(self), fields(user_id = %user_id, amount = %amount))]
    pub async fn calculate_discount(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<Decimal, ServiceError> {
        let program = self.get_or_create_program(user_id).await?;
        Ok(discount_for(program.tier, amount))
    }
}
