use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod outbox;

/// Domain events emitted after state changes commit. Delivery is
/// at-least-once: services emit directly on the channel and the key
/// transitions are also written to the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),

    PaymentCreated(Uuid),
    PaymentApproved(Uuid),
    PaymentRejected(Uuid),
    PaymentCancelled(Uuid),
    PaymentExpired(Uuid),

    LoyaltyPointsEarned {
        user_id: Uuid,
        order_id: Uuid,
        points: i32,
    },
    LoyaltyPointsRedeemed {
        user_id: Uuid,
        points: i32,
    },
}

impl Event {
    /// Stable name used as the outbox event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::OrderCreated(_) => "OrderCreated",
            Event::OrderStatusChanged { .. } => "OrderStatusChanged",
            Event::OrderCancelled(_) => "OrderCancelled",
            Event::PaymentCreated(_) => "PaymentCreated",
            Event::PaymentApproved(_) => "PaymentApproved",
            Event::PaymentRejected(_) => "PaymentRejected",
            Event::PaymentCancelled(_) => "PaymentCancelled",
            Event::PaymentExpired(_) => "PaymentExpired",
            Event::LoyaltyPointsEarned { .. } => "LoyaltyPointsEarned",
            Event::LoyaltyPointsRedeemed { .. } => "LoyaltyPointsRedeemed",
        }
    }

    /// JSON payload written to the outbox.
    pub fn payload(&self) -> Value {
        match self {
            Event::OrderCreated(id) | Event::OrderCancelled(id) => {
                json!({ "order_id": id.to_string() })
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => json!({
                "order_id": order_id.to_string(),
                "old_status": old_status,
                "new_status": new_status,
            }),
            Event::PaymentCreated(id)
            | Event::PaymentApproved(id)
            | Event::PaymentRejected(id)
            | Event::PaymentCancelled(id)
            | Event::PaymentExpired(id) => json!({ "payment_id": id.to_string() }),
            Event::LoyaltyPointsEarned {
                user_id,
                order_id,
                points,
            } => json!({
                "user_id": user_id.to_string(),
                "order_id": order_id.to_string(),
                "points": points,
            }),
            Event::LoyaltyPointsRedeemed { user_id, points } => json!({
                "user_id": user_id.to_string(),
                "points": points,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Consumer loop for the in-process event channel. Today this logs; side
/// effects like notifications hang off this loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentRejected(payment_id) => {
                warn!(payment_id = %payment_id, "payment rejected");
            }
            Event::PaymentExpired(payment_id) => {
                warn!(payment_id = %payment_id, "payment expired");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id = %order_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "order status changed"
                );
            }
            other => {
                info!(event_type = other.event_type(), "event processed");
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_round_trip_the_identifiers() {
        let order_id = Uuid::new_v4();
        let payload = Event::OrderCreated(order_id).payload();
        assert_eq!(
            payload.get("order_id").and_then(Value::as_str),
            Some(order_id.to_string().as_str())
        );

        let user_id = Uuid::new_v4();
        let payload = Event::LoyaltyPointsEarned {
            user_id,
            order_id,
            points: 1000,
        }
        .payload();
        assert_eq!(payload.get("points"), Some(&json!(1000)));
    }

    #[tokio::test]
    async fn sender_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let payment_id = Uuid::new_v4();
        sender.send(Event::PaymentApproved(payment_id)).await.unwrap();
        match rx.recv().await {
            Some(Event::PaymentApproved(id)) => assert_eq!(id, payment_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
