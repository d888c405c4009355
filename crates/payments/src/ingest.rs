//! Webhook ingestion
//!
//! Every delivery that parses is written to the webhook log with
//! `processed = false` before any business logic runs, so a crash mid-way
//! still leaves a replayable record. The row is then completed with the
//! outcome, and the disposition tells the HTTP layer which status to return:
//! transient failures become 500 so the gateway redelivers, payload errors
//! become 400, everything else is acknowledged.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::engine::{ReconcileOutcome, ReconcileSource, ReconciliationEngine};
use crate::error::{PaymentError, PaymentResult};
use crate::events::{GatewayEvent, WebhookEnvelope};
use crate::machine::Observation;
use crate::store::{NewWebhookEvent, WebhookEvent, WebhookEventLog};

/// Processing error recorded for deliveries that failed the secret check
pub const SECRET_MISMATCH_ERROR: &str = "webhook secret mismatch";

/// Rows returned by `history` when no limit is given
pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// How the delivery should be answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestDisposition {
    /// 200 - processed, informational, or resolved locally
    Acknowledged,
    /// 400 - body is not a webhook envelope
    InvalidPayload,
    /// 401 - payment event without a valid shared secret
    Unauthorized,
    /// 500 - transient failure, gateway should redeliver
    RetryLater,
}

impl IngestDisposition {
    pub fn http_status(&self) -> u16 {
        match self {
            IngestDisposition::Acknowledged => 200,
            IngestDisposition::InvalidPayload => 400,
            IngestDisposition::Unauthorized => 401,
            IngestDisposition::RetryLater => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub disposition: IngestDisposition,
    /// Webhook log row, absent when nothing was persisted
    pub event_id: Option<Uuid>,
    pub outcome: Option<ProcessedEvent>,
    pub error: Option<String>,
}

impl IngestReport {
    fn rejected(disposition: IngestDisposition, event_id: Option<Uuid>, error: String) -> Self {
        Self {
            disposition,
            event_id,
            outcome: None,
            error: Some(error),
        }
    }
}

/// What processing a parsed event amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedEvent {
    Reconciled(ReconcileOutcome),
    /// Telemetry-only event type
    Informational,
    Unrecognized,
}

impl ProcessedEvent {
    fn note(&self) -> Option<String> {
        match self {
            ProcessedEvent::Reconciled(outcome) => outcome.anomaly(),
            ProcessedEvent::Informational => None,
            ProcessedEvent::Unrecognized => Some("unrecognized event type".to_string()),
        }
    }
}

/// Result of replaying one stored delivery
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub event_id: Uuid,
    pub event_type: String,
    pub previous_error: Option<String>,
    pub new_error: Option<String>,
    pub success: bool,
}

#[derive(Clone)]
pub struct WebhookIngestService {
    log: Arc<dyn WebhookEventLog>,
    engine: ReconciliationEngine,
    webhook_secret: Option<String>,
}

impl WebhookIngestService {
    pub fn new(
        log: Arc<dyn WebhookEventLog>,
        engine: ReconciliationEngine,
        webhook_secret: Option<String>,
    ) -> Self {
        if webhook_secret.is_none() {
            tracing::warn!(
                "No webhook secret configured - payment events will not be authenticated"
            );
        }
        Self {
            log,
            engine,
            webhook_secret,
        }
    }

    /// Handle one inbound delivery
    pub async fn ingest(&self, raw_body: &str, secret_header: Option<&str>) -> IngestReport {
        self.ingest_raw(raw_body, secret_header.map(str::as_bytes))
            .await
    }

    /// Handle one inbound delivery whose secret header may not be valid text
    ///
    /// The header is stored lossily for audit and compared byte for byte.
    pub async fn ingest_raw(&self, raw_body: &str, secret_header: Option<&[u8]>) -> IngestReport {
        if raw_body.trim().is_empty() {
            tracing::warn!("Rejected webhook with empty body");
            return IngestReport::rejected(
                IngestDisposition::InvalidPayload,
                None,
                "empty body".to_string(),
            );
        }

        let envelope = match WebhookEnvelope::parse(raw_body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    payload_len = raw_body.len(),
                    error = %e,
                    "Rejected webhook with unparseable payload"
                );
                return IngestReport::rejected(
                    IngestDisposition::InvalidPayload,
                    None,
                    e.to_string(),
                );
            }
        };
        let event = GatewayEvent::from(&envelope);

        let record = match self
            .log
            .append(NewWebhookEvent {
                event_type: envelope.event_type.clone(),
                intent_id: event.intent_id().map(str::to_string),
                payload: raw_body.to_string(),
                secret_header: secret_header
                    .map(|raw| String::from_utf8_lossy(raw).into_owned()),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to persist webhook delivery - asking gateway to retry"
                );
                return IngestReport::rejected(IngestDisposition::RetryLater, None, e.to_string());
            }
        };

        tracing::info!(
            webhook_event_id = %record.id,
            event_type = %record.event_type,
            intent_id = ?record.intent_id,
            "Webhook delivery recorded"
        );

        if event.requires_secret() && !self.secret_matches(secret_header) {
            tracing::warn!(
                webhook_event_id = %record.id,
                event_type = %record.event_type,
                secret_present = secret_header.is_some(),
                "Webhook secret mismatch for payment event"
            );
            self.complete_record(record.id, false, Some(SECRET_MISMATCH_ERROR))
                .await;
            return IngestReport::rejected(
                IngestDisposition::Unauthorized,
                Some(record.id),
                SECRET_MISMATCH_ERROR.to_string(),
            );
        }

        match self.process(&event, ReconcileSource::Webhook).await {
            Ok(processed) => {
                let note = processed.note();
                self.complete_record(record.id, true, note.as_deref()).await;
                IngestReport {
                    disposition: IngestDisposition::Acknowledged,
                    event_id: Some(record.id),
                    outcome: Some(processed),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    webhook_event_id = %record.id,
                    event_type = %record.event_type,
                    error = %e,
                    "Webhook processing failed - gateway will redeliver"
                );
                let message = e.to_string();
                self.complete_record(record.id, false, Some(&message)).await;
                IngestReport::rejected(IngestDisposition::RetryLater, Some(record.id), message)
            }
        }
    }

    /// Route a parsed event through the engine
    async fn process(
        &self,
        event: &GatewayEvent,
        source: ReconcileSource,
    ) -> PaymentResult<ProcessedEvent> {
        let (intent_id, observation) = match event {
            GatewayEvent::PaymentSucceeded { intent_id } => (intent_id, Observation::Succeeded),
            GatewayEvent::PaymentFailed { intent_id, error } => (
                intent_id,
                Observation::Failed {
                    error: error.clone(),
                },
            ),
            GatewayEvent::PaymentDeferred { intent_id } => (intent_id, Observation::Deferred),
            GatewayEvent::CheckoutSessionSucceeded { session_id } => {
                tracing::info!(session_id = %session_id, "Checkout session succeeded");
                return Ok(ProcessedEvent::Informational);
            }
            GatewayEvent::MobileTransferReceived { transfer_id } => {
                tracing::info!(transfer_id = %transfer_id, "Mobile transfer received");
                return Ok(ProcessedEvent::Informational);
            }
            GatewayEvent::Unrecognized { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    "Received unhandled gateway event type - no handler configured"
                );
                return Ok(ProcessedEvent::Unrecognized);
            }
        };

        let outcome = self
            .engine
            .reconcile(intent_id, &observation, source)
            .await?;
        Ok(ProcessedEvent::Reconciled(outcome))
    }

    fn secret_matches(&self, provided: Option<&[u8]>) -> bool {
        match (&self.webhook_secret, provided) {
            (None, _) => true,
            (Some(expected), Some(provided)) => bool::from(expected.as_bytes().ct_eq(provided)),
            (Some(_), None) => false,
        }
    }

    /// Write the outcome onto the log row, retrying once
    async fn complete_record(&self, id: Uuid, processed: bool, error: Option<&str>) {
        if let Err(first) = self.log.complete(id, processed, error).await {
            tracing::warn!(
                webhook_event_id = %id,
                error = %first,
                "First attempt to update webhook event failed, retrying..."
            );
            if let Err(retry) = self.log.complete(id, processed, error).await {
                tracing::error!(
                    webhook_event_id = %id,
                    processed = processed,
                    error_message = ?error,
                    first_error = %first,
                    retry_error = %retry,
                    "Failed to record webhook outcome after retry - row left unprocessed"
                );
            }
        }
    }

    /// Newest deliveries first, limit clamped to 1..=100
    pub async fn history(&self, limit: Option<i64>) -> PaymentResult<Vec<WebhookEvent>> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        self.log.recent(limit).await
    }

    /// Re-run processing for a stored delivery
    ///
    /// The stored secret header is not re-validated, so deliveries that were
    /// refused for a secret mismatch cannot be replayed.
    pub async fn replay(&self, event_id: Uuid) -> PaymentResult<WebhookReplayResult> {
        let record = self
            .log
            .get(event_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("webhook event {event_id}")))?;

        if record.processing_error.as_deref() == Some(SECRET_MISMATCH_ERROR) {
            tracing::warn!(
                webhook_event_id = %event_id,
                event_type = %record.event_type,
                "Refusing to replay webhook that failed the secret check"
            );
            return Err(PaymentError::WebhookSecretMismatch);
        }

        tracing::info!(
            webhook_event_id = %event_id,
            event_type = %record.event_type,
            "Attempting to replay webhook event"
        );

        let envelope = WebhookEnvelope::parse(&record.payload)?;
        let event = GatewayEvent::from(&envelope);
        let result = self.process(&event, ReconcileSource::Replay).await;

        let (processed, new_error) = match &result {
            Ok(processed) => (true, processed.note()),
            Err(e) => (false, Some(e.to_string())),
        };
        self.log
            .complete(event_id, processed, new_error.as_deref())
            .await?;

        tracing::info!(
            webhook_event_id = %event_id,
            success = processed,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            event_id,
            event_type: record.event_type,
            previous_error: record.processing_error,
            new_error,
            success: processed,
        })
    }

    /// Replay unprocessed deliveries, oldest first
    pub async fn replay_unprocessed(&self, max_events: i64) -> PaymentResult<Vec<WebhookReplayResult>> {
        let pending = self.log.list_replayable(max_events).await?;
        let mut results = Vec::with_capacity(pending.len());

        for record in pending {
            match self.replay(record.id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        webhook_event_id = %record.id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        event_id: record.id,
                        event_type: record.event_type,
                        previous_error: record.processing_error,
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::dispatcher::SideEffectDispatcher;
    use crate::intent::{Actor, Currency, IntentStatus, NewPaymentIntent, Target};
    use crate::memory::MemoryStore;
    use crate::store::PaymentIntentStore;

    fn service(store: &MemoryStore, secret: Option<&str>) -> WebhookIngestService {
        let engine = ReconciliationEngine::new(
            Arc::new(store.clone()),
            SideEffectDispatcher::new(Arc::new(store.clone())),
            ReconcileConfig::default(),
        );
        WebhookIngestService::new(Arc::new(store.clone()), engine, secret.map(str::to_string))
    }

    async fn seed(store: &MemoryStore) {
        store.add_listing(42).await;
        store
            .insert(NewPaymentIntent {
                intent_id: "pi_ingest".into(),
                amount_cents: 2500,
                currency: Currency::new("CRC").unwrap(),
                status: IntentStatus::RequiresConfirmation,
                description: "Listing".into(),
                target: Target::Listing(42),
                actor: Actor::default(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    const SUCCEEDED: &str = r#"{"type":"payment-intent.succeeded","data":{"id":"pi_ingest"}}"#;

    #[tokio::test]
    async fn secret_mismatch_is_recorded_but_not_processed() {
        let store = MemoryStore::new();
        seed(&store).await;
        let svc = service(&store, Some("s3cret"));

        let report = svc.ingest(SUCCEEDED, Some("wrong")).await;
        assert_eq!(report.disposition, IngestDisposition::Unauthorized);

        let rows = svc.history(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].processed);
        assert_eq!(rows[0].processing_error.as_deref(), Some(SECRET_MISMATCH_ERROR));
        assert_eq!(rows[0].secret_header.as_deref(), Some("wrong"));
        assert!(!store.is_active(Target::Listing(42)).await);

        // Not eligible for bulk replay
        assert!(svc.replay_unprocessed(10).await.unwrap().is_empty());

        // Nor for a targeted one
        let err = svc.replay(report.event_id.unwrap()).await.unwrap_err();
        assert!(matches!(err, PaymentError::WebhookSecretMismatch));
        assert!(!store.is_active(Target::Listing(42)).await);
        assert_eq!(
            PaymentIntentStore::get(&store, "pi_ingest")
                .await
                .unwrap()
                .unwrap()
                .status,
            IntentStatus::RequiresConfirmation
        );
        let row = svc.history(None).await.unwrap().remove(0);
        assert!(!row.processed);
        assert_eq!(row.processing_error.as_deref(), Some(SECRET_MISMATCH_ERROR));
    }

    #[tokio::test]
    async fn non_text_secret_is_kept_for_audit() {
        let store = MemoryStore::new();
        seed(&store).await;
        let svc = service(&store, Some("s3cret"));

        let report = svc.ingest_raw(SUCCEEDED, Some(&[0x73, 0xff, 0x21])).await;
        assert_eq!(report.disposition, IngestDisposition::Unauthorized);

        let row = svc.history(None).await.unwrap().remove(0);
        assert_eq!(row.secret_header.as_deref(), Some("s\u{fffd}!"));
        assert!(!store.is_active(Target::Listing(42)).await);
    }

    #[tokio::test]
    async fn raw_secret_bytes_are_compared_exactly() {
        let store = MemoryStore::new();
        seed(&store).await;
        let svc = service(&store, Some("s3cret"));

        let report = svc.ingest_raw(SUCCEEDED, Some(b"s3cret")).await;
        assert_eq!(report.disposition, IngestDisposition::Acknowledged);
        assert!(store.is_active(Target::Listing(42)).await);
    }

    #[tokio::test]
    async fn informational_events_skip_secret_check() {
        let store = MemoryStore::new();
        let svc = service(&store, Some("s3cret"));
        let report = svc
            .ingest(
                r#"{"type":"checkout-session.succeeded","data":{"id":"cs_1"}}"#,
                None,
            )
            .await;
        assert_eq!(report.disposition, IngestDisposition::Acknowledged);
        assert_eq!(report.outcome, Some(ProcessedEvent::Informational));
        let rows = svc.history(None).await.unwrap();
        assert!(rows[0].processed);
        assert_eq!(rows[0].intent_id, None);
    }

    #[tokio::test]
    async fn unrecognized_event_is_acknowledged() {
        let store = MemoryStore::new();
        let svc = service(&store, None);
        let report = svc
            .ingest(r#"{"type":"payout.paid","data":{"id":"po_1"}}"#, None)
            .await;
        assert_eq!(report.disposition, IngestDisposition::Acknowledged);
        assert_eq!(report.outcome, Some(ProcessedEvent::Unrecognized));
    }

    #[tokio::test]
    async fn replay_completes_failed_delivery() {
        let store = MemoryStore::new();
        seed(&store).await;
        store.fail_next_activations(1).await;
        let svc = service(&store, None);

        let report = svc.ingest(SUCCEEDED, None).await;
        assert_eq!(report.disposition, IngestDisposition::RetryLater);
        assert_eq!(report.disposition.http_status(), 500);

        let results = svc.replay_unprocessed(10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].previous_error.is_some());
        assert!(store.is_active(Target::Listing(42)).await);

        let row = svc.history(Some(1)).await.unwrap().remove(0);
        assert!(row.processed);
    }

    #[tokio::test]
    async fn history_limit_is_capped() {
        let store = MemoryStore::new();
        let svc = service(&store, None);
        for i in 0..105 {
            let body = format!(r#"{{"type":"mobile-transfer.received","data":{{"id":"mt_{i}"}}}}"#);
            svc.ingest(&body, None).await;
        }
        assert_eq!(svc.history(Some(500)).await.unwrap().len(), 100);
        assert_eq!(svc.history(None).await.unwrap().len(), 20);

        let newest = svc.history(Some(1)).await.unwrap().remove(0);
        assert!(newest.payload.contains("mt_104"));
    }
}
