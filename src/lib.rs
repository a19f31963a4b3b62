pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod services;

use std::sync::Arc;

use config::AppConfig;
use db::DbPool;
use events::EventSender;
use services::{
    loyalty::LoyaltyService, orders::OrderService, payments::PaymentService,
    reconciliation::WebhookReconciler,
};

/// Shared application state handed to the HTTP layer.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<WebhookReconciler>,
    pub loyalty: Arc<LoyaltyService>,
}
