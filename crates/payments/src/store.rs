//! Storage seams
//!
//! The engine talks to persistence only through these traits. Postgres
//! implementations live in [`crate::postgres`], in-memory ones in
//! [`crate::memory`].

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PaymentResult;
use crate::intent::{IntentSnapshot, NewPaymentIntent, PaymentIntent, Target};
use crate::machine::Transition;

/// Result of a compare-and-swap on a payment intent
#[derive(Debug, Clone)]
pub enum CasResult {
    /// The predicate matched; carries the new row image
    Applied(PaymentIntent),
    /// Another writer changed the row first
    Conflict,
}

#[async_trait]
pub trait PaymentIntentStore: Send + Sync {
    /// Record a new intent. Fails with `DuplicateIntent` on an existing id.
    async fn insert(&self, intent: NewPaymentIntent) -> PaymentResult<PaymentIntent>;

    async fn get(&self, intent_id: &str) -> PaymentResult<Option<PaymentIntent>>;

    /// Apply `transition` only if the row still matches `expected`
    /// (status and confirmation attempts).
    async fn compare_and_set(
        &self,
        intent_id: &str,
        expected: &IntentSnapshot,
        transition: &Transition,
    ) -> PaymentResult<CasResult>;

    /// Non-terminal intents not updated since `updated_before`, oldest first
    async fn list_stale(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> PaymentResult<Vec<PaymentIntent>>;
}

/// Outcome of one activation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Target activated and marker set in the same transaction
    Activated,
    /// Marker was already set; nothing written
    AlreadyFired,
    /// Listing or ad slot no longer exists; anomaly recorded on the intent
    TargetMissing,
    /// Intent has no target
    NotApplicable,
}

/// Listing / ad-slot activation bound to the side-effect marker
#[async_trait]
pub trait SideEffectStore: Send + Sync {
    /// In one transaction: if the intent is `succeeded` and its marker is
    /// unset, activate `target` and set the marker. Activating an already
    /// active target is a no-op write.
    async fn activate_once(&self, intent_id: &str, target: Target)
        -> PaymentResult<ActivationOutcome>;
}

/// A persisted inbound webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: String,
    pub intent_id: Option<String>,
    pub payload: String,
    pub secret_header: Option<String>,
    pub processed: bool,
    pub processing_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_type: String,
    pub intent_id: Option<String>,
    pub payload: String,
    pub secret_header: Option<String>,
}

/// Append-only webhook delivery log
#[async_trait]
pub trait WebhookEventLog: Send + Sync {
    /// Persist a delivery with `processed = false`
    async fn append(&self, event: NewWebhookEvent) -> PaymentResult<WebhookEvent>;

    /// Record the processing outcome
    async fn complete(
        &self,
        id: Uuid,
        processed: bool,
        processing_error: Option<&str>,
    ) -> PaymentResult<()>;

    async fn get(&self, id: Uuid) -> PaymentResult<Option<WebhookEvent>>;

    /// Newest first
    async fn recent(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>>;

    /// Unprocessed rows eligible for replay, oldest first. Rows rejected for a
    /// secret mismatch are excluded.
    async fn list_replayable(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>>;
}
