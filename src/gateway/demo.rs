use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::gateway::{
    parse_webhook_payload, GatewayRequest, GatewayResponse, PaymentGateway, WebhookDescriptor,
};

/// 1x1 transparent PNG, stands in for the provider-rendered QR image.
const DEMO_QR_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

/// Demonstration adapter, selected only by the explicit `demo_mode` config
/// flag. Every operation succeeds deterministically without network calls,
/// so checkout flows can be exercised end to end in development.
pub struct DemoGateway;

impl DemoGateway {
    pub fn new() -> Self {
        Self
    }

    /// Demo external ids are derived from the order id so repeated runs for
    /// the same order are recognizable in logs.
    fn demo_id(request: &GatewayRequest) -> String {
        let hex: String = request
            .order_id
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        format!("DEMO-{}", hex.to_uppercase())
    }

    /// EMV-style PIX copy-and-paste payload embedding the order reference.
    fn demo_pix_payload(request: &GatewayRequest) -> String {
        format!(
            "00020126580014br.gov.bcb.pix0136demo-churras-{}520400005303986540{}5802BR5913Churras Demo6009Sao Paulo62070503***6304ABCD",
            request.order_id, request.amount
        )
    }
}

impl Default for DemoGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for DemoGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_checkout(&self, request: &GatewayRequest) -> GatewayResponse {
        if request.items.is_empty() {
            return GatewayResponse::error("Checkout request has no items");
        }
        let id = Self::demo_id(request);
        info!(demo_payment_id = %id, "demo checkout created");
        GatewayResponse {
            success: true,
            external_preference_id: Some(format!("{id}-PREF")),
            checkout_url: Some(format!("https://churras.demo/checkout/{id}")),
            status: Some("pending".to_string()),
            raw_response: Some(json!({
                "demo_mode": true,
                "order_id": request.order_id.to_string(),
                "amount": request.amount,
            })),
            ..Default::default()
        }
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_pix_payment(&self, request: &GatewayRequest) -> GatewayResponse {
        if request.amount <= rust_decimal::Decimal::ZERO {
            return GatewayResponse::error("PIX amount must be positive");
        }
        let id = Self::demo_id(request);
        info!(demo_payment_id = %id, "demo pix payment created");
        GatewayResponse {
            success: true,
            external_payment_id: Some(id.clone()),
            qr_code: Some(Self::demo_pix_payload(request)),
            qr_code_base64: Some(DEMO_QR_BASE64.to_string()),
            ticket_url: Some(format!("https://churras.demo/pix/{id}")),
            status: Some("pending".to_string()),
            raw_response: Some(json!({
                "demo_mode": true,
                "order_id": request.order_id.to_string(),
                "amount": request.amount,
                "description": request.description,
            })),
            ..Default::default()
        }
    }

    async fn get_payment(&self, external_payment_id: &str) -> GatewayResponse {
        GatewayResponse {
            success: true,
            external_payment_id: Some(external_payment_id.to_string()),
            status: Some("pending".to_string()),
            raw_response: Some(json!({ "demo_mode": true })),
            ..Default::default()
        }
    }

    async fn cancel_payment(&self, external_payment_id: &str) -> GatewayResponse {
        GatewayResponse {
            success: true,
            external_payment_id: Some(external_payment_id.to_string()),
            status: Some("cancelled".to_string()),
            raw_response: Some(json!({ "demo_mode": true })),
            ..Default::default()
        }
    }

    /// Demo webhooks trust the payload's own status field; there is no
    /// provider to re-query.
    async fn process_webhook(&self, payload: &Value) -> WebhookDescriptor {
        let mut descriptor = parse_webhook_payload(payload);
        if descriptor.valid {
            descriptor.status = payload
                .pointer("/data/status")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment::PaymentMethod;
    use crate::gateway::BackUrls;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn request() -> GatewayRequest {
        GatewayRequest {
            order_id: Uuid::new_v4(),
            method: PaymentMethod::Pix,
            amount: dec!(75.00),
            description: "Pedido de teste".into(),
            customer_email: None,
            items: vec![crate::gateway::GatewayLineItem {
                title: "Picanha".into(),
                quantity: 3,
                unit_price: dec!(25.00),
            }],
            back_urls: BackUrls::default(),
            additional_data: None,
        }
    }

    #[tokio::test]
    async fn pix_artifacts_are_deterministic_per_order() {
        let gateway = DemoGateway::new();
        let request = request();
        let first = gateway.create_pix_payment(&request).await;
        let second = gateway.create_pix_payment(&request).await;

        assert!(first.is_success());
        assert_eq!(first.external_payment_id, second.external_payment_id);
        assert_eq!(first.qr_code, second.qr_code);

        let id = first.external_payment_id.unwrap();
        assert!(id.starts_with("DEMO-"));
        assert_eq!(id.len(), "DEMO-".len() + 8);
        assert!(first
            .qr_code
            .unwrap()
            .contains(&request.order_id.to_string()));
    }

    #[tokio::test]
    async fn demo_responses_are_flagged_as_demo() {
        let gateway = DemoGateway::new();
        let response = gateway.create_checkout(&request()).await;
        assert!(response.is_success());
        assert_eq!(
            response.raw_response.unwrap().get("demo_mode"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn demo_adapter_validates_like_the_real_one() {
        let gateway = DemoGateway::new();

        let mut empty = request();
        empty.items.clear();
        let response = gateway.create_checkout(&empty).await;
        assert!(!response.is_success());
        assert_eq!(
            response.error_message.as_deref(),
            Some("Checkout request has no items")
        );

        let mut free = request();
        free.amount = dec!(0.00);
        let response = gateway.create_pix_payment(&free).await;
        assert!(!response.is_success());
        assert_eq!(
            response.error_message.as_deref(),
            Some("PIX amount must be positive")
        );
    }

    #[tokio::test]
    async fn demo_webhook_reads_status_from_payload() {
        let gateway = DemoGateway::new();
        let descriptor = gateway
            .process_webhook(&serde_json::json!({
                "type": "payment",
                "data": { "id": "DEMO-ABCD1234", "status": "approved" }
            }))
            .await;
        assert!(descriptor.valid);
        assert_eq!(descriptor.status.as_deref(), Some("approved"));
    }
}
