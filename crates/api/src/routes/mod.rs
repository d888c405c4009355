//! HTTP routes

pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Gateway webhooks
        .route("/webhooks/payments", post(webhooks::receive_webhook))
        .route("/webhooks/payments/health", get(webhooks::health))
        .route("/webhooks/payments/history", get(webhooks::history))
        // Checkout
        .route("/payments/create-intent", post(payments::create_intent))
        .route("/payments/status/{intent_id}", get(payments::intent_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
