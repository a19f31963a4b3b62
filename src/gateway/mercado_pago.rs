use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::config::MercadoPagoConfig;
use crate::gateway::{
    parse_webhook_payload, GatewayRequest, GatewayResponse, PaymentGateway, WebhookDescriptor,
};

/// Mercado Pago adapter. All provider failures come back as unsuccessful
/// `GatewayResponse`s; the caller decides what they mean for payment state.
pub struct MercadoPagoGateway {
    client: Client,
    config: MercadoPagoConfig,
}

impl MercadoPagoGateway {
    pub fn new(config: MercadoPagoConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn access_token(&self) -> Result<&str, GatewayResponse> {
        match self.config.access_token.as_deref() {
            Some(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(GatewayResponse::error(
                "Mercado Pago access token is not configured",
            )),
        }
    }

    async fn read_json(response: reqwest::Response) -> Result<(bool, Value), GatewayResponse> {
        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                return Err(GatewayResponse::error(format!(
                    "provider returned an unreadable body: {err}"
                )))
            }
        };
        Ok((status.is_success(), body))
    }

    fn provider_error(context: &str, body: &Value) -> GatewayResponse {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");
        let mut response = GatewayResponse::error(format!("{context}: {message}"));
        response.raw_response = Some(body.clone());
        response
    }

    fn payment_response(body: Value) -> GatewayResponse {
        let transaction_data = body
            .pointer("/point_of_interaction/transaction_data")
            .cloned()
            .unwrap_or(Value::Null);
        GatewayResponse {
            success: true,
            external_payment_id: body
                .get("id")
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
            external_preference_id: None,
            checkout_url: None,
            qr_code: transaction_data
                .get("qr_code")
                .and_then(Value::as_str)
                .map(str::to_string),
            qr_code_base64: transaction_data
                .get("qr_code_base64")
                .and_then(Value::as_str)
                .map(str::to_string),
            ticket_url: body
                .pointer("/transaction_details/external_resource_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            error_message: None,
            raw_response: Some(body),
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_checkout(&self, request: &GatewayRequest) -> GatewayResponse {
        if request.items.is_empty() {
            return GatewayResponse::error("Checkout request has no items");
        }
        let token = match self.access_token() {
            Ok(token) => token,
            Err(response) => return response,
        };

        let items: Vec<Value> = request
            .items
            .iter()
            .map(|item| {
                json!({
                    "title": item.title,
                    "quantity": item.quantity,
                    "unit_price": item.unit_price,
                    "currency_id": "BRL",
                })
            })
            .collect();

        let body = json!({
            "items": items,
            "external_reference": request.order_id.to_string(),
            "back_urls": {
                "success": request.back_urls.success,
                "failure": request.back_urls.failure,
                "pending": request.back_urls.pending,
            },
            "auto_return": "approved",
            "payer": request.customer_email.as_ref().map(|email| json!({ "email": email })),
            "metadata": request.additional_data,
        });

        let result = self
            .client
            .post(format!("{}/checkout/preferences", self.config.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "checkout preference request failed");
                return GatewayResponse::error(format!("provider request failed: {err}"));
            }
        };

        match Self::read_json(response).await {
            Ok((true, body)) => GatewayResponse {
                success: true,
                external_preference_id: body
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                checkout_url: body
                    .get("init_point")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                status: Some("pending".to_string()),
                raw_response: Some(body),
                ..Default::default()
            },
            Ok((false, body)) => Self::provider_error("checkout preference rejected", &body),
            Err(response) => response,
        }
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_pix_payment(&self, request: &GatewayRequest) -> GatewayResponse {
        if request.amount <= Decimal::ZERO {
            return GatewayResponse::error("PIX amount must be positive");
        }
        let token = match self.access_token() {
            Ok(token) => token,
            Err(response) => return response,
        };

        let body = json!({
            "transaction_amount": request.amount,
            "description": request.description,
            "payment_method_id": "pix",
            "external_reference": request.order_id.to_string(),
            "payer": {
                "email": request
                    .customer_email
                    .as_deref()
                    .unwrap_or("guest@churras.example"),
            },
            "metadata": request.additional_data,
        });

        let result = self
            .client
            .post(format!("{}/v1/payments", self.config.base_url))
            .bearer_auth(token)
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "pix payment request failed");
                return GatewayResponse::error(format!("provider request failed: {err}"));
            }
        };

        match Self::read_json(response).await {
            Ok((true, body)) => Self::payment_response(body),
            Ok((false, body)) => Self::provider_error("pix payment rejected", &body),
            Err(response) => response,
        }
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, external_payment_id: &str) -> GatewayResponse {
        let token = match self.access_token() {
            Ok(token) => token,
            Err(response) => return response,
        };

        let result = self
            .client
            .get(format!(
                "{}/v1/payments/{}",
                self.config.base_url, external_payment_id
            ))
            .bearer_auth(token)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "payment lookup request failed");
                return GatewayResponse::error(format!("provider request failed: {err}"));
            }
        };

        match Self::read_json(response).await {
            Ok((true, body)) => Self::payment_response(body),
            Ok((false, body)) => Self::provider_error("payment lookup failed", &body),
            Err(response) => response,
        }
    }

    #[instrument(skip(self))]
    async fn cancel_payment(&self, external_payment_id: &str) -> GatewayResponse {
        let token = match self.access_token() {
            Ok(token) => token,
            Err(response) => return response,
        };

        let result = self
            .client
            .put(format!(
                "{}/v1/payments/{}",
                self.config.base_url, external_payment_id
            ))
            .bearer_auth(token)
            .json(&json!({ "status": "cancelled" }))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "payment cancel request failed");
                return GatewayResponse::error(format!("provider request failed: {err}"));
            }
        };

        match Self::read_json(response).await {
            Ok((true, body)) => Self::payment_response(body),
            Ok((false, body)) => Self::provider_error("payment cancel failed", &body),
            Err(response) => response,
        }
    }

    /// Parses the payload, then re-queries the provider for the payment's
    /// current status. The webhook body alone is not trusted for state.
    async fn process_webhook(&self, payload: &Value) -> WebhookDescriptor {
        let mut descriptor = parse_webhook_payload(payload);
        if !descriptor.valid {
            return descriptor;
        }
        let external_id = descriptor
            .external_payment_id
            .clone()
            .unwrap_or_default();

        let lookup = self.get_payment(&external_id).await;
        if lookup.is_success() {
            descriptor.status = lookup.status;
        } else {
            warn!(
                external_payment_id = %external_id,
                error = ?lookup.error_message,
                "could not fetch payment status for webhook"
            );
            descriptor.valid = false;
            descriptor.error_message = lookup.error_message;
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment::PaymentMethod;
    use crate::gateway::{BackUrls, GatewayLineItem};
    use rust_decimal_macros::dec;

    fn gateway() -> MercadoPagoGateway {
        MercadoPagoGateway::new(MercadoPagoConfig {
            access_token: Some("TEST-token".into()),
            ..Default::default()
        })
    }

    fn request(amount: Decimal, items: Vec<GatewayLineItem>) -> GatewayRequest {
        GatewayRequest {
            order_id: uuid::Uuid::new_v4(),
            method: PaymentMethod::Pix,
            amount,
            description: "Pedido de teste".into(),
            customer_email: None,
            items,
            back_urls: BackUrls::default(),
            additional_data: None,
        }
    }

    #[tokio::test]
    async fn checkout_without_items_fails_before_any_request() {
        let response = gateway().create_checkout(&request(dec!(50.00), vec![])).await;
        assert!(!response.is_success());
        assert_eq!(
            response.error_message.as_deref(),
            Some("Checkout request has no items")
        );
        assert!(response.raw_response.is_none());
    }

    #[tokio::test]
    async fn pix_with_nonpositive_amount_fails_before_any_request() {
        let line = GatewayLineItem {
            title: "Picanha".into(),
            quantity: 1,
            unit_price: dec!(25.00),
        };
        for amount in [dec!(0.00), dec!(-1.00)] {
            let response = gateway()
                .create_pix_payment(&request(amount, vec![line.clone()]))
                .await;
            assert!(!response.is_success());
            assert_eq!(
                response.error_message.as_deref(),
                Some("PIX amount must be positive")
            );
        }
    }
}
