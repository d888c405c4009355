//! Gateway webhook events
//!
//! The gateway posts `{ "type": "...", "data": { "id": "...", ... } }`. The
//! envelope is parsed once and then narrowed into [`GatewayEvent`], a closed
//! set of the event kinds this service understands.

use serde::Deserialize;

use crate::error::{PaymentError, PaymentResult};

pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment-intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment-intent.failed";
pub const PAYMENT_INTENT_DEFERRED: &str = "payment-intent.deferred";
pub const CHECKOUT_SESSION_SUCCEEDED: &str = "checkout-session.succeeded";
pub const MOBILE_TRANSFER_RECEIVED: &str = "mobile-transfer.received";

/// Raw webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub id: String,
    #[serde(default, rename = "lastPaymentError", alias = "last_payment_error")]
    pub last_payment_error: Option<GatewayErrorDetail>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl GatewayErrorDetail {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "payment failed".to_string(),
        }
    }
}

impl WebhookEnvelope {
    /// Parse a raw body. Empty bodies and shape mismatches are `InvalidPayload`.
    pub fn parse(raw: &str) -> PaymentResult<Self> {
        if raw.trim().is_empty() {
            return Err(PaymentError::InvalidPayload("empty body".to_string()));
        }
        let envelope: WebhookEnvelope = serde_json::from_str(raw)?;
        if envelope.event_type.trim().is_empty() {
            return Err(PaymentError::InvalidPayload("missing event type".to_string()));
        }
        if envelope.data.id.trim().is_empty() {
            return Err(PaymentError::InvalidPayload("missing data.id".to_string()));
        }
        Ok(envelope)
    }
}

/// Event kinds the reconciliation pipeline distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    PaymentSucceeded { intent_id: String },
    PaymentFailed { intent_id: String, error: String },
    PaymentDeferred { intent_id: String },
    /// Telemetry only, never mutates an intent
    CheckoutSessionSucceeded { session_id: String },
    /// Telemetry only, never mutates an intent
    MobileTransferReceived { transfer_id: String },
    Unrecognized { event_type: String },
}

impl From<&WebhookEnvelope> for GatewayEvent {
    fn from(envelope: &WebhookEnvelope) -> Self {
        let id = envelope.data.id.clone();
        match envelope.event_type.as_str() {
            PAYMENT_INTENT_SUCCEEDED => GatewayEvent::PaymentSucceeded { intent_id: id },
            PAYMENT_INTENT_FAILED => GatewayEvent::PaymentFailed {
                intent_id: id,
                error: envelope
                    .data
                    .last_payment_error
                    .as_ref()
                    .map(GatewayErrorDetail::describe)
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            PAYMENT_INTENT_DEFERRED => GatewayEvent::PaymentDeferred { intent_id: id },
            CHECKOUT_SESSION_SUCCEEDED => GatewayEvent::CheckoutSessionSucceeded { session_id: id },
            MOBILE_TRANSFER_RECEIVED => GatewayEvent::MobileTransferReceived { transfer_id: id },
            other => GatewayEvent::Unrecognized {
                event_type: other.to_string(),
            },
        }
    }
}

impl GatewayEvent {
    /// Intent referenced by this event, if it is a payment-intent event
    pub fn intent_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::PaymentSucceeded { intent_id }
            | GatewayEvent::PaymentFailed { intent_id, .. }
            | GatewayEvent::PaymentDeferred { intent_id } => Some(intent_id),
            _ => None,
        }
    }

    /// Payment-intent events carry money movement and require the shared secret
    pub fn requires_secret(&self) -> bool {
        self.intent_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_succeeded_event() {
        let env = WebhookEnvelope::parse(
            r#"{"type":"payment-intent.succeeded","data":{"id":"pi_123","amount":2500}}"#,
        )
        .unwrap();
        assert_eq!(env.data.extra.get("amount"), Some(&serde_json::json!(2500)));
        assert_eq!(
            GatewayEvent::from(&env),
            GatewayEvent::PaymentSucceeded {
                intent_id: "pi_123".into()
            }
        );
    }

    #[test]
    fn failed_event_carries_error_detail() {
        let env = WebhookEnvelope::parse(
            r#"{"type":"payment-intent.failed","data":{"id":"pi_9","lastPaymentError":{"code":"card_declined","message":"Tarjeta rechazada"}}}"#,
        )
        .unwrap();
        assert_eq!(
            GatewayEvent::from(&env),
            GatewayEvent::PaymentFailed {
                intent_id: "pi_9".into(),
                error: "card_declined: Tarjeta rechazada".into()
            }
        );
    }

    #[test]
    fn informational_events_reference_no_intent() {
        let env = WebhookEnvelope::parse(
            r#"{"type":"mobile-transfer.received","data":{"id":"mt_1"}}"#,
        )
        .unwrap();
        let event = GatewayEvent::from(&env);
        assert_eq!(event.intent_id(), None);
        assert!(!event.requires_secret());
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let env =
            WebhookEnvelope::parse(r#"{"type":"refund.created","data":{"id":"re_1"}}"#).unwrap();
        assert_eq!(
            GatewayEvent::from(&env),
            GatewayEvent::Unrecognized {
                event_type: "refund.created".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_bodies() {
        for body in ["", "   ", "not json", r#"{"type":"x"}"#, r#"{"type":"x","data":{}}"#, r#"{"type":"","data":{"id":"a"}}"#] {
            assert!(
                matches!(
                    WebhookEnvelope::parse(body),
                    Err(PaymentError::InvalidPayload(_))
                ),
                "body {body:?} should be rejected"
            );
        }
    }
}
