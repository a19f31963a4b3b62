use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, QueryResult, Statement};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Enqueue a domain event into the outbox table, inside the same transaction
/// as the state change it describes.
pub async fn enqueue(
    db: &impl ConnectionTrait,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event: &Event,
) -> Result<(), ServiceError> {
    if db.get_database_backend() != DbBackend::Postgres {
        debug!(
            "outbox enqueue skipped for non-Postgres backend (aggregate_type={}, event_type={})",
            aggregate_type,
            event.event_type()
        );
        return Ok(());
    }

    let id = Uuid::new_v4();
    let sql = r#"INSERT INTO outbox_events
        (id, aggregate_type, aggregate_id, event_type, payload, status, attempts, available_at, created_at)
        VALUES ($1, $2, $3, $4, $5::jsonb, 'pending', 0, NOW(), NOW())"#;
    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        sql,
        vec![
            id.into(),
            aggregate_type.into(),
            aggregate_id.map(|v| v.into()).unwrap_or(Value::Null.into()),
            event.event_type().into(),
            event.payload().into(),
        ],
    );
    db.execute(stmt).await.map_err(ServiceError::db_error)?;
    debug!(
        "enqueued outbox event {} type={} agg={}",
        id,
        event.event_type(),
        aggregate_type
    );
    Ok(())
}

/// Background worker to poll and dispatch outbox events via in-process EventSender.
pub async fn start_worker(db: Arc<DatabaseConnection>, sender: EventSender) {
    if db.get_database_backend() != DbBackend::Postgres {
        info!(
            "Outbox worker disabled for {:?} backend; relying on direct event emission",
            db.get_database_backend()
        );
        return;
    }

    tokio::spawn(async move {
        loop {
            if let Err(e) = drain_once(&db, &sender, 50).await {
                error!("outbox worker error: {}", e);
            }
            sleep(Duration::from_millis(500)).await;
        }
    });
}

async fn drain_once(
    db: &DatabaseConnection,
    sender: &EventSender,
    batch_size: i64,
) -> Result<(), ServiceError> {
    const MAX_ATTEMPTS: i32 = 8;
    const BASE_BACKOFF_SECS: u64 = 2; // exponential backoff base
                                      // Mark a batch as processing and return them (advisory lock-like behavior)
    let sql_claim = r#"
        WITH cte AS (
            SELECT id FROM outbox_events
            WHERE status = 'pending' AND available_at <= NOW()
            ORDER BY created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $1
        )
        UPDATE outbox_events o
        SET status = 'processing', updated_at = NOW(), attempts = o.attempts + 1
        FROM cte
        WHERE o.id = cte.id
        RETURNING o.id, o.event_type, o.payload
    "#;
    let stmt =
        Statement::from_sql_and_values(DbBackend::Postgres, sql_claim, vec![batch_size.into()]);
    let rows: Vec<QueryResult> = db.query_all(stmt).await.map_err(ServiceError::db_error)?;

    for row in rows {
        let id: Uuid = row.try_get("", "id").unwrap_or_default();
        let et: String = row.try_get("", "event_type").unwrap_or_default();
        let payload: Value = row.try_get("", "payload").unwrap_or(Value::Null);

        let Some(evt) = map_to_event(&et, &payload) else {
            warn!("outbox event {} has unknown type {}; marking failed", id, et);
            let sql_fail = r#"UPDATE outbox_events SET status = 'failed', updated_at = NOW(), error_message = 'unknown event type' WHERE id = $1"#;
            let stmt_fail =
                Statement::from_sql_and_values(DbBackend::Postgres, sql_fail, vec![id.into()]);
            if let Err(e) = db.execute(stmt_fail).await {
                warn!("failed marking outbox {} failed: {}", id, e);
            }
            continue;
        };

        let dispatch_ok = sender.send(evt).await.is_ok();
        if dispatch_ok {
            let sql_update = r#"UPDATE outbox_events SET status = 'delivered', processed_at = NOW(), updated_at = NOW(), error_message = NULL WHERE id = $1"#;
            let stmt_upd =
                Statement::from_sql_and_values(DbBackend::Postgres, sql_update, vec![id.into()]);
            if let Err(e) = db.execute(stmt_upd).await {
                warn!("failed updating outbox {}: {}", id, e);
            }
        } else {
            // Check attempts and schedule retry using exponential backoff with jitter
            let sql_attempts = r#"SELECT attempts FROM outbox_events WHERE id = $1"#;
            let row = db
                .query_one(Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    sql_attempts,
                    vec![id.into()],
                ))
                .await
                .map_err(ServiceError::db_error)?;
            let attempts: i32 = row
                .and_then(|r| r.try_get("", "attempts").ok())
                .unwrap_or(1);
            if attempts < MAX_ATTEMPTS {
                let backoff = BASE_BACKOFF_SECS.saturating_pow(attempts as u32);
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                let jitter = now_ms % 1000; // ms
                let sql_retry = r#"UPDATE outbox_events SET status = 'pending', available_at = NOW() + make_interval(secs := $2::int) + ($3::int * interval '1 millisecond'), updated_at = NOW(), error_message = 'send failed' WHERE id = $1"#;
                let stmt_retry = Statement::from_sql_and_values(
                    DbBackend::Postgres,
                    sql_retry,
                    vec![id.into(), (backoff as i64).into(), (jitter as i64).into()],
                );
                if let Err(e) = db.execute(stmt_retry).await {
                    warn!("failed scheduling retry for outbox {}: {}", id, e);
                }
            } else {
                let sql_fail = r#"UPDATE outbox_events SET status = 'failed', updated_at = NOW(), error_message = 'max attempts exceeded' WHERE id = $1"#;
                let stmt_fail =
                    Statement::from_sql_and_values(DbBackend::Postgres, sql_fail, vec![id.into()]);
                if let Err(e) = db.execute(stmt_fail).await {
                    warn!("failed marking outbox {} failed: {}", id, e);
                }
            }
        }
    }
    Ok(())
}

fn parse_uuid(payload: &Value, key: &str) -> Option<Uuid> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn map_to_event(event_type: &str, payload: &Value) -> Option<Event> {
    match event_type {
        "OrderCreated" => parse_uuid(payload, "order_id").map(Event::OrderCreated),
        "OrderCancelled" => parse_uuid(payload, "order_id").map(Event::OrderCancelled),
        "OrderStatusChanged" => {
            let order_id = parse_uuid(payload, "order_id")?;
            let old_status = payload.get("old_status")?.as_str()?.to_string();
            let new_status = payload.get("new_status")?.as_str()?.to_string();
            Some(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
        }
        "PaymentCreated" => parse_uuid(payload, "payment_id").map(Event::PaymentCreated),
        "PaymentApproved" => parse_uuid(payload, "payment_id").map(Event::PaymentApproved),
        "PaymentRejected" => parse_uuid(payload, "payment_id").map(Event::PaymentRejected),
        "PaymentCancelled" => parse_uuid(payload, "payment_id").map(Event::PaymentCancelled),
        "PaymentExpired" => parse_uuid(payload, "payment_id").map(Event::PaymentExpired),
        "LoyaltyPointsEarned" => {
            let user_id = parse_uuid(payload, "user_id")?;
            let order_id = parse_uuid(payload, "order_id")?;
            let points = payload.get("points")?.as_i64()? as i32;
            Some(Event::LoyaltyPointsEarned {
                user_id,
                order_id,
                points,
            })
        }
        "LoyaltyPointsRedeemed" => {
            let user_id = parse_uuid(payload, "user_id")?;
            let points = payload.get("points")?.as_i64()? as i32;
            Some(Event::LoyaltyPointsRedeemed { user_id, points })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_order_status_changed_event() {
        let order_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "order_id": order_id.to_string(),
            "old_status": "PENDING",
            "new_status": "CONFIRMED",
        });

        let event = map_to_event("OrderStatusChanged", &payload).expect("event not mapped");
        match event {
            Event::OrderStatusChanged {
                order_id: mapped_order_id,
                old_status,
                new_status,
            } => {
                assert_eq!(mapped_order_id, order_id);
                assert_eq!(old_status, "PENDING");
                assert_eq!(new_status, "CONFIRMED");
            }
            other => unreachable!("test expected OrderStatusChanged but got {:?}", other),
        }
    }

    #[test]
    fn maps_loyalty_points_earned_event() {
        let user_id = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "user_id": user_id.to_string(),
            "order_id": order_id.to_string(),
            "points": 1000,
        });

        let event = map_to_event("LoyaltyPointsEarned", &payload).expect("event not mapped");
        match event {
            Event::LoyaltyPointsEarned {
                user_id: mapped_user_id,
                order_id: mapped_order_id,
                points,
            } => {
                assert_eq!(mapped_user_id, user_id);
                assert_eq!(mapped_order_id, order_id);
                assert_eq!(points, 1000);
            }
            other => unreachable!("test expected LoyaltyPointsEarned but got {:?}", other),
        }
    }

    #[test]
    fn every_event_round_trips_through_its_payload() {
        let id = Uuid::new_v4();
        let events = [
            Event::OrderCreated(id),
            Event::OrderCancelled(id),
            Event::PaymentCreated(id),
            Event::PaymentApproved(id),
            Event::PaymentRejected(id),
            Event::PaymentCancelled(id),
            Event::PaymentExpired(id),
        ];
        for event in events {
            let mapped = map_to_event(event.event_type(), &event.payload());
            assert!(mapped.is_some(), "{} did not map", event.event_type());
        }
    }

    #[test]
    fn unknown_event_type_maps_to_none() {
        assert!(map_to_event("ShipmentCreated", &serde_json::json!({})).is_none());
    }
}
