//! Payment invariants
//!
//! Read-only consistency checks over the persisted intents and webhook log,
//! run periodically by the worker and after bulk replays. A violation names
//! the rows involved and carries enough context to investigate by hand.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::config::DEFAULT_MAX_CONFIRMATION_ATTEMPTS;
use crate::error::PaymentResult;

/// One failed invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Payment intents or webhook event ids involved
    pub subject_ids: Vec<String>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// A listing may have been activated without payment
    Critical,
    /// A customer paid but did not get what they paid for
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MarkerWithoutSuccessRow {
    intent_id: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingSideEffectRow {
    intent_id: String,
    target_kind: String,
    target_id: i64,
    last_error: Option<String>,
    completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverCeilingRow {
    intent_id: String,
    status: String,
    confirmation_attempts: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    id: uuid::Uuid,
    event_type: String,
    processing_error: Option<String>,
    received_at: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
    max_confirmation_attempts: i32,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_confirmation_attempts: DEFAULT_MAX_CONFIRMATION_ATTEMPTS,
        }
    }

    pub fn with_max_confirmation_attempts(mut self, ceiling: i32) -> Self {
        self.max_confirmation_attempts = ceiling;
        self
    }

    pub async fn run_all_checks(&self) -> PaymentResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        violations.extend(self.check_marker_implies_success().await?);
        violations.extend(self.check_succeeded_side_effect_fired().await?);
        violations.extend(self.check_attempts_within_ceiling().await?);
        violations.extend(self.check_webhooks_processed().await?);

        let summary = InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        );
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Payment invariants hold");
        } else {
            for v in &summary.violations {
                tracing::warn!(
                    invariant = %v.invariant,
                    severity = %v.severity,
                    subjects = ?v.subject_ids,
                    "{}",
                    v.description
                );
            }
        }
        Ok(summary)
    }

    /// The marker is only ever set on succeeded intents. Anything else means
    /// a listing went live for a payment that did not clear.
    async fn check_marker_implies_success(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<MarkerWithoutSuccessRow> = sqlx::query_as(
            r#"
            SELECT intent_id, status
            FROM payment_intents
            WHERE side_effect_fired = TRUE
              AND status <> 'succeeded'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "marker_implies_success".to_string(),
                description: format!(
                    "Intent {} has its side effect fired but status '{}'",
                    row.intent_id, row.status
                ),
                context: serde_json::json!({ "status": row.status }),
                subject_ids: vec![row.intent_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_succeeded_side_effect_fired(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingSideEffectRow> = sqlx::query_as(
            r#"
            SELECT intent_id, target_kind, target_id, last_error, completed_at
            FROM payment_intents
            WHERE status = 'succeeded'
              AND side_effect_fired = FALSE
              AND target_kind IS NOT NULL
              AND target_id IS NOT NULL
            ORDER BY completed_at ASC NULLS FIRST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "succeeded_side_effect_fired".to_string(),
                description: format!(
                    "Intent {} succeeded but {}#{} was never activated",
                    row.intent_id, row.target_kind, row.target_id
                ),
                context: serde_json::json!({
                    "target_kind": row.target_kind,
                    "target_id": row.target_id,
                    "last_error": row.last_error,
                    "completed_at": row.completed_at.map(|t| t.unix_timestamp()),
                }),
                subject_ids: vec![row.intent_id],
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_attempts_within_ceiling(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<OverCeilingRow> = sqlx::query_as(
            r#"
            SELECT intent_id, status, confirmation_attempts
            FROM payment_intents
            WHERE status NOT IN ('succeeded', 'failed', 'canceled')
              AND confirmation_attempts > $1
            "#,
        )
        .bind(self.max_confirmation_attempts)
        .fetch_all(&self.pool)
        .await?;

        let ceiling = self.max_confirmation_attempts;
        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "attempts_within_ceiling".to_string(),
                description: format!(
                    "Intent {} is still '{}' after {} confirmation attempts (ceiling {})",
                    row.intent_id, row.status, row.confirmation_attempts, ceiling
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "confirmation_attempts": row.confirmation_attempts,
                    "ceiling": ceiling,
                }),
                subject_ids: vec![row.intent_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Deliveries left unprocessed for over an hour have missed replay
    async fn check_webhooks_processed(&self) -> PaymentResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT id, event_type, processing_error, received_at
            FROM webhook_events
            WHERE processed = FALSE
              AND received_at < NOW() - INTERVAL '1 hour'
            ORDER BY received_at ASC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(vec![]);
        }

        let oldest = rows.first().map(|r| r.received_at.unix_timestamp());
        let errors: Vec<_> = rows
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "event_type": r.event_type,
                    "processing_error": r.processing_error,
                })
            })
            .collect();

        Ok(vec![InvariantViolation {
            invariant: "webhooks_processed".to_string(),
            description: format!(
                "{} webhook deliveries unprocessed for more than an hour",
                rows.len()
            ),
            context: serde_json::json!({
                "oldest_received_at": oldest,
                "events": errors,
            }),
            subject_ids: rows.iter().map(|r| r.id.to_string()).collect(),
            severity: ViolationSeverity::Medium,
        }])
    }

    pub async fn run_check(&self, name: &str) -> PaymentResult<Vec<InvariantViolation>> {
        match name {
            "marker_implies_success" => self.check_marker_implies_success().await,
            "succeeded_side_effect_fired" => self.check_succeeded_side_effect_fired().await,
            "attempts_within_ceiling" => self.check_attempts_within_ceiling().await,
            "webhooks_processed" => self.check_webhooks_processed().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "marker_implies_success",
            "succeeded_side_effect_fired",
            "attempts_within_ceiling",
            "webhooks_processed",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            subject_ids: vec!["pi_1".into()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            4,
            vec![
                violation("succeeded_side_effect_fired"),
                violation("succeeded_side_effect_fired"),
                violation("webhooks_processed"),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 2);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(4, vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 4);
    }

    #[test]
    fn every_check_is_runnable_by_name() {
        assert_eq!(InvariantChecker::available_checks().len(), 4);
        assert!(InvariantChecker::available_checks().contains(&"marker_implies_success"));
    }
}
