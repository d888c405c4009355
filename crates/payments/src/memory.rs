//! In-memory store
//!
//! Implements every storage trait over a single mutex so that the marker and
//! activation writes are atomic, the same guarantee the Postgres
//! implementation gets from a transaction. Used by tests and local runs
//! without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::ingest::SECRET_MISMATCH_ERROR;
use crate::intent::{IntentSnapshot, NewPaymentIntent, PaymentIntent, Target};
use crate::machine::Transition;
use crate::store::{
    ActivationOutcome, CasResult, NewWebhookEvent, PaymentIntentStore, SideEffectStore,
    WebhookEvent, WebhookEventLog,
};

#[derive(Debug, Default)]
struct Inner {
    intents: HashMap<String, PaymentIntent>,
    webhook_events: Vec<WebhookEvent>,
    /// id -> active
    listings: HashMap<i64, bool>,
    /// id -> enabled
    ad_slots: HashMap<i64, bool>,
    activation_writes: usize,
    failing_activations: usize,
}

/// Shared in-memory state; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inactive listing
    pub async fn add_listing(&self, id: i64) {
        self.inner.lock().await.listings.insert(id, false);
    }

    /// Register a disabled ad slot
    pub async fn add_ad_slot(&self, id: i64) {
        self.inner.lock().await.ad_slots.insert(id, false);
    }

    /// Simulate the owner deleting a listing
    #[cfg(any(test, feature = "test-support"))]
    pub async fn remove_listing(&self, id: i64) {
        self.inner.lock().await.listings.remove(&id);
    }

    pub async fn is_active(&self, target: Target) -> bool {
        let inner = self.inner.lock().await;
        match target {
            Target::Listing(id) => inner.listings.get(&id).copied().unwrap_or(false),
            Target::AdSlot(id) => inner.ad_slots.get(&id).copied().unwrap_or(false),
            Target::None => false,
        }
    }

    /// Number of activation writes performed so far
    pub async fn activation_writes(&self) -> usize {
        self.inner.lock().await.activation_writes
    }

    /// Make the next `n` activation attempts fail as if the database dropped
    #[cfg(any(test, feature = "test-support"))]
    pub async fn fail_next_activations(&self, n: usize) {
        self.inner.lock().await.failing_activations = n;
    }

    pub async fn webhook_event_count(&self) -> usize {
        self.inner.lock().await.webhook_events.len()
    }
}

#[async_trait]
impl PaymentIntentStore for MemoryStore {
    async fn insert(&self, intent: NewPaymentIntent) -> PaymentResult<PaymentIntent> {
        let mut inner = self.inner.lock().await;
        if inner.intents.contains_key(&intent.intent_id) {
            return Err(PaymentError::DuplicateIntent(intent.intent_id));
        }
        let now = OffsetDateTime::now_utc();
        let row = PaymentIntent {
            intent_id: intent.intent_id.clone(),
            amount_cents: intent.amount_cents,
            currency: intent.currency,
            status: intent.status,
            description: intent.description,
            target: intent.target,
            actor: intent.actor,
            metadata: intent.metadata,
            last_error: None,
            confirmation_attempts: 0,
            side_effect_fired: false,
            side_effect_fired_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.intents.insert(intent.intent_id, row.clone());
        Ok(row)
    }

    async fn get(&self, intent_id: &str) -> PaymentResult<Option<PaymentIntent>> {
        Ok(self.inner.lock().await.intents.get(intent_id).cloned())
    }

    async fn compare_and_set(
        &self,
        intent_id: &str,
        expected: &IntentSnapshot,
        transition: &Transition,
    ) -> PaymentResult<CasResult> {
        let mut inner = self.inner.lock().await;
        let Some(row) = inner.intents.get_mut(intent_id) else {
            return Ok(CasResult::Conflict);
        };
        if row.status != expected.status
            || row.confirmation_attempts != expected.confirmation_attempts
        {
            return Ok(CasResult::Conflict);
        }

        let now = OffsetDateTime::now_utc();
        row.status = transition.to;
        if let Some(error) = &transition.last_error {
            row.last_error = Some(error.clone());
        }
        if transition.bump_attempts {
            row.confirmation_attempts += 1;
        }
        if transition.to.is_terminal() {
            row.completed_at = Some(now);
        }
        row.updated_at = now;
        Ok(CasResult::Applied(row.clone()))
    }

    async fn list_stale(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> PaymentResult<Vec<PaymentIntent>> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<PaymentIntent> = inner
            .intents
            .values()
            .filter(|i| !i.status.is_terminal() && i.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|i| i.updated_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }
}

#[async_trait]
impl SideEffectStore for MemoryStore {
    async fn activate_once(
        &self,
        intent_id: &str,
        target: Target,
    ) -> PaymentResult<ActivationOutcome> {
        let mut inner = self.inner.lock().await;

        if inner.failing_activations > 0 {
            inner.failing_activations -= 1;
            return Err(PaymentError::Database(
                "simulated activation failure".to_string(),
            ));
        }

        let Some(intent) = inner.intents.get(intent_id) else {
            return Err(PaymentError::NotFound(format!("payment intent {intent_id}")));
        };
        if intent.side_effect_fired {
            return Ok(ActivationOutcome::AlreadyFired);
        }
        if intent.status != crate::intent::IntentStatus::Succeeded {
            return Err(PaymentError::Internal(format!(
                "refusing to activate {target} for {} intent {intent_id}",
                intent.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let exists = match target {
            Target::Listing(id) => inner.listings.get_mut(&id).map(|active| *active = true),
            Target::AdSlot(id) => inner.ad_slots.get_mut(&id).map(|enabled| *enabled = true),
            Target::None => return Ok(ActivationOutcome::NotApplicable),
        };

        let outcome = if exists.is_some() {
            inner.activation_writes += 1;
            ActivationOutcome::Activated
        } else {
            ActivationOutcome::TargetMissing
        };

        if let Some(intent) = inner.intents.get_mut(intent_id) {
            match outcome {
                ActivationOutcome::Activated => {
                    intent.side_effect_fired = true;
                    intent.side_effect_fired_at = Some(now);
                }
                _ => {
                    intent.last_error = Some(format!("side effect target missing: {target}"));
                }
            }
            intent.updated_at = now;
        }

        Ok(outcome)
    }
}

#[async_trait]
impl WebhookEventLog for MemoryStore {
    async fn append(&self, event: NewWebhookEvent) -> PaymentResult<WebhookEvent> {
        let row = WebhookEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            intent_id: event.intent_id,
            payload: event.payload,
            secret_header: event.secret_header,
            processed: false,
            processing_error: None,
            received_at: OffsetDateTime::now_utc(),
            processed_at: None,
        };
        self.inner.lock().await.webhook_events.push(row.clone());
        Ok(row)
    }

    async fn complete(
        &self,
        id: Uuid,
        processed: bool,
        processing_error: Option<&str>,
    ) -> PaymentResult<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .webhook_events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| PaymentError::NotFound(format!("webhook event {id}")))?;
        row.processed = processed;
        row.processing_error = processing_error.map(str::to_string);
        row.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> PaymentResult<Option<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.webhook_events.iter().find(|e| e.id == id).cloned())
    }

    async fn recent(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .webhook_events
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn list_replayable(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .webhook_events
            .iter()
            .filter(|e| {
                !e.processed && e.processing_error.as_deref() != Some(SECRET_MISMATCH_ERROR)
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
