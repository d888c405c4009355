//! Intent creation and status lookup
//!
//! The only writes outside the reconciliation engine: a new intent is opened
//! on the gateway and recorded locally in `requires_confirmation`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::{CreateIntentParams, GatewayClient};
use crate::intent::{Actor, Currency, IntentStatus, NewPaymentIntent, PaymentIntent, Target};
use crate::store::PaymentIntentStore;

/// Request from the marketplace UI to pay for something
#[derive(Debug, Clone, Deserialize)]
pub struct CreateIntentRequest {
    /// Minor currency units
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub description: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedIntent {
    pub intent_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub publishable_key: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    gateway: Arc<dyn GatewayClient>,
    intents: Arc<dyn PaymentIntentStore>,
    publishable_key: String,
    default_currency: Currency,
}

impl CheckoutService {
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        intents: Arc<dyn PaymentIntentStore>,
        publishable_key: String,
        default_currency: Currency,
    ) -> Self {
        Self {
            gateway,
            intents,
            publishable_key,
            default_currency,
        }
    }

    pub async fn create_intent(&self, request: CreateIntentRequest) -> PaymentResult<CreatedIntent> {
        if request.amount <= 0 {
            return Err(PaymentError::InvalidInput(
                "amount must be a positive integer in minor units".to_string(),
            ));
        }
        let currency = match request.currency.as_deref() {
            Some(code) => Currency::new(code)?,
            None => self.default_currency.clone(),
        };
        let description = request.description.trim().to_string();
        if description.is_empty() {
            return Err(PaymentError::InvalidInput(
                "description is required".to_string(),
            ));
        }
        match request.target {
            Target::Listing(id) | Target::AdSlot(id) if id <= 0 => {
                return Err(PaymentError::InvalidInput(format!(
                    "target id must be positive, got {id}"
                )));
            }
            _ => {}
        }

        let mut metadata = request.metadata;
        let (target_kind, target_id) = request.target.to_columns();
        if let (Some(kind), Some(id)) = (target_kind, target_id) {
            metadata.insert("target_kind".to_string(), kind.to_string());
            metadata.insert("target_id".to_string(), id.to_string());
        }
        if let Some(user_id) = &request.user_id {
            metadata.insert("user_id".to_string(), user_id.clone());
        }

        let gateway_intent = self
            .gateway
            .create_intent(&CreateIntentParams {
                amount: request.amount,
                currency: currency.as_str().to_string(),
                description: description.clone(),
                metadata: metadata.clone(),
            })
            .await?;

        if let Some(amount) = gateway_intent.amount {
            if amount != request.amount {
                tracing::warn!(
                    intent_id = %gateway_intent.id,
                    requested = request.amount,
                    gateway_amount = amount,
                    "Gateway echoed a different amount"
                );
            }
        }

        let intent = self
            .intents
            .insert(NewPaymentIntent {
                intent_id: gateway_intent.id,
                amount_cents: request.amount,
                currency,
                status: IntentStatus::RequiresConfirmation,
                description,
                target: request.target,
                actor: Actor {
                    user_id: request.user_id,
                    email: request.email,
                },
                metadata,
            })
            .await?;

        tracing::info!(
            intent_id = %intent.intent_id,
            amount_cents = intent.amount_cents,
            currency = %intent.currency,
            target = %intent.target,
            "Payment intent recorded"
        );

        Ok(CreatedIntent {
            intent_id: intent.intent_id,
            amount: intent.amount_cents,
            currency: intent.currency.to_string(),
            status: intent.status,
            publishable_key: self.publishable_key.clone(),
        })
    }

    pub async fn status(&self, intent_id: &str) -> PaymentResult<PaymentIntent> {
        self.intents
            .get(intent_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment intent {intent_id}")))
    }
}
