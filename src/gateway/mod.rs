pub mod demo;
pub mod mercado_pago;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::payment::PaymentMethod;

/// One checkout line item forwarded to the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayLineItem {
    pub title: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Return URLs for hosted-checkout flows.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Provider-agnostic charge request assembled by the payment service.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub description: String,
    pub customer_email: Option<String>,
    pub items: Vec<GatewayLineItem>,
    pub back_urls: BackUrls,
    /// Arbitrary key-value data forwarded to the provider as metadata.
    pub additional_data: Option<Value>,
}

/// Provider-agnostic outcome. A failed provider call is still an `Ok`
/// response with `success` unset; transport code never decides payment
/// state, the service does.
#[derive(Clone, Debug, Default)]
pub struct GatewayResponse {
    pub success: bool,
    pub external_payment_id: Option<String>,
    pub external_preference_id: Option<String>,
    pub checkout_url: Option<String>,
    pub qr_code: Option<String>,
    pub qr_code_base64: Option<String>,
    pub ticket_url: Option<String>,
    pub status: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<Value>,
}

impl GatewayResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// Result of interpreting a webhook payload, before any state is touched.
#[derive(Clone, Debug, Default)]
pub struct WebhookDescriptor {
    pub valid: bool,
    pub external_payment_id: Option<String>,
    pub status: Option<String>,
    pub action: Option<String>,
    pub event_type: Option<String>,
    pub error_message: Option<String>,
}

impl WebhookDescriptor {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Extracts the event type and payment id from a provider notification.
/// Only `"type": "payment"` notifications are actionable; the payment id may
/// arrive as a JSON string or a number.
pub fn parse_webhook_payload(payload: &Value) -> WebhookDescriptor {
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    if event_type.as_deref() != Some("payment") {
        return WebhookDescriptor {
            event_type,
            ..WebhookDescriptor::invalid("notification is not a payment event")
        };
    }

    let id_value = payload.get("data").and_then(|d| d.get("id"));
    let external_payment_id = match id_value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let Some(external_payment_id) = external_payment_id else {
        return WebhookDescriptor {
            event_type,
            ..WebhookDescriptor::invalid("payment notification has no data.id")
        };
    };

    WebhookDescriptor {
        valid: true,
        external_payment_id: Some(external_payment_id),
        status: None,
        action: payload
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string),
        event_type,
        error_message: None,
    }
}

/// Port the payment service talks to. One adapter per provider, plus the
/// demonstration adapter used when `demo_mode` is enabled.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a hosted-checkout preference for redirect methods.
    async fn create_checkout(&self, request: &GatewayRequest) -> GatewayResponse;

    /// Creates a direct PIX charge, returning the QR artifacts.
    async fn create_pix_payment(&self, request: &GatewayRequest) -> GatewayResponse;

    /// Fetches the provider's current view of a payment.
    async fn get_payment(&self, external_payment_id: &str) -> GatewayResponse;

    /// Asks the provider to cancel a payment.
    async fn cancel_payment(&self, external_payment_id: &str) -> GatewayResponse;

    /// Interprets a webhook payload, enriching it with the provider's
    /// current payment status where the payload alone is not enough.
    async fn process_webhook(&self, payload: &Value) -> WebhookDescriptor;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payment_webhook_with_numeric_id_parses() {
        let descriptor = parse_webhook_payload(&json!({
            "type": "payment",
            "action": "payment.updated",
            "data": { "id": 1234567890 }
        }));
        assert!(descriptor.valid);
        assert_eq!(descriptor.external_payment_id.as_deref(), Some("1234567890"));
        assert_eq!(descriptor.action.as_deref(), Some("payment.updated"));
    }

    #[test]
    fn payment_webhook_with_string_id_parses() {
        let descriptor = parse_webhook_payload(&json!({
            "type": "payment",
            "data": { "id": "1234567890" }
        }));
        assert!(descriptor.valid);
        assert_eq!(descriptor.external_payment_id.as_deref(), Some("1234567890"));
    }

    #[test]
    fn non_payment_notification_is_ignored() {
        let descriptor = parse_webhook_payload(&json!({
            "type": "merchant_order",
            "data": { "id": 99 }
        }));
        assert!(!descriptor.valid);
        assert_eq!(descriptor.event_type.as_deref(), Some("merchant_order"));
    }

    #[test]
    fn missing_data_id_is_invalid() {
        let descriptor = parse_webhook_payload(&json!({ "type": "payment" }));
        assert!(!descriptor.valid);
        assert!(descriptor.error_message.is_some());
    }
}
