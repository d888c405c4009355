//! Checkout routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use carmarket_payments::{CreateIntentRequest, CreatedIntent, IntentStatus, PaymentIntent};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Open a payment intent for a listing or ad slot
pub async fn create_intent(
    State(state): State<AppState>,
    payload: Result<Json<CreateIntentRequest>, JsonRejection>,
) -> ApiResult<Json<CreatedIntent>> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let created = state.payments.checkout.create_intent(request).await?;
    Ok(Json(created))
}

#[derive(Debug, Serialize)]
pub struct IntentStatusResponse {
    pub intent_id: String,
    pub status: IntentStatus,
    pub amount: i64,
    pub currency: String,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl From<PaymentIntent> for IntentStatusResponse {
    fn from(intent: PaymentIntent) -> Self {
        Self {
            intent_id: intent.intent_id,
            status: intent.status,
            amount: intent.amount_cents,
            currency: intent.currency.to_string(),
            last_error: intent.last_error,
            created_at: intent.created_at,
            updated_at: intent.updated_at,
            completed_at: intent.completed_at,
        }
    }
}

pub async fn intent_status(
    State(state): State<AppState>,
    Path(intent_id): Path<String>,
) -> ApiResult<Json<IntentStatusResponse>> {
    let intent = state.payments.checkout.status(&intent_id).await?;
    Ok(Json(intent.into()))
}
