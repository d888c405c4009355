//! Postgres-backed stores
//!
//! Runtime-checked sqlx queries against the tables in `migrations/`. The
//! compare-and-swap is a single conditional `UPDATE ... RETURNING`; the
//! activation and its marker share one transaction with the intent row
//! locked `FOR UPDATE`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::ingest::SECRET_MISMATCH_ERROR;
use crate::intent::{
    Actor, Currency, IntentSnapshot, IntentStatus, NewPaymentIntent, PaymentIntent, Target,
};
use crate::machine::Transition;
use crate::store::{
    ActivationOutcome, CasResult, NewWebhookEvent, PaymentIntentStore, SideEffectStore,
    WebhookEvent, WebhookEventLog,
};

/// Embedded schema migrations for this crate
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const INTENT_COLUMNS: &str = r#"
    intent_id, amount_cents, currency::TEXT AS currency, status, description,
    target_kind, target_id, actor_user_id, actor_email, metadata, last_error,
    confirmation_attempts, side_effect_fired, side_effect_fired_at,
    created_at, updated_at, completed_at
"#;

const WEBHOOK_COLUMNS: &str = r#"
    id, event_type, intent_id, payload, secret_header, processed,
    processing_error, received_at, processed_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    intent_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    description: String,
    target_kind: Option<String>,
    target_id: Option<i64>,
    actor_user_id: Option<String>,
    actor_email: Option<String>,
    metadata: Json<BTreeMap<String, String>>,
    last_error: Option<String>,
    confirmation_attempts: i32,
    side_effect_fired: bool,
    side_effect_fired_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = PaymentError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(PaymentIntent {
            target: Target::from_columns(row.target_kind.as_deref(), row.target_id)?,
            status: row.status.parse()?,
            currency: Currency::new(&row.currency)?,
            intent_id: row.intent_id,
            amount_cents: row.amount_cents,
            description: row.description,
            actor: Actor {
                user_id: row.actor_user_id,
                email: row.actor_email,
            },
            metadata: row.metadata.0,
            last_error: row.last_error,
            confirmation_attempts: row.confirmation_attempts,
            side_effect_fired: row.side_effect_fired,
            side_effect_fired_at: row.side_effect_fired_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    event_type: String,
    intent_id: Option<String>,
    payload: String,
    secret_header: Option<String>,
    processed: bool,
    processing_error: Option<String>,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl From<WebhookRow> for WebhookEvent {
    fn from(row: WebhookRow) -> Self {
        WebhookEvent {
            id: row.id,
            event_type: row.event_type,
            intent_id: row.intent_id,
            payload: row.payload,
            secret_header: row.secret_header,
            processed: row.processed,
            processing_error: row.processing_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

/// Every payments store over one connection pool
#[derive(Debug, Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Flip the target on. Returns false when the row does not exist.
    async fn activate_target(
        tx: &mut Transaction<'_, Postgres>,
        target: Target,
    ) -> PaymentResult<bool> {
        let result = match target {
            Target::Listing(id) => {
                sqlx::query("UPDATE listings SET is_active = TRUE WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?
            }
            Target::AdSlot(id) => {
                sqlx::query("UPDATE ad_slots SET is_enabled = TRUE WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?
            }
            Target::None => return Ok(false),
        };
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PaymentIntentStore for PgPaymentStore {
    async fn insert(&self, intent: NewPaymentIntent) -> PaymentResult<PaymentIntent> {
        let (target_kind, target_id) = intent.target.to_columns();
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_intents
                (intent_id, amount_cents, currency, status, description,
                 target_kind, target_id, actor_user_id, actor_email, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (intent_id) DO NOTHING
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(&intent.intent_id)
        .bind(intent.amount_cents)
        .bind(intent.currency.as_str())
        .bind(intent.status.as_str())
        .bind(&intent.description)
        .bind(target_kind)
        .bind(target_id)
        .bind(&intent.actor.user_id)
        .bind(&intent.actor.email)
        .bind(Json(&intent.metadata))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(PaymentError::DuplicateIntent(intent.intent_id)),
        }
    }

    async fn get(&self, intent_id: &str) -> PaymentResult<Option<PaymentIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents WHERE intent_id = $1"
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentIntent::try_from).transpose()
    }

    async fn compare_and_set(
        &self,
        intent_id: &str,
        expected: &IntentSnapshot,
        transition: &Transition,
    ) -> PaymentResult<CasResult> {
        let row: Option<IntentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_intents SET
                status = $4,
                last_error = COALESCE($5, last_error),
                confirmation_attempts = confirmation_attempts + $6,
                completed_at = CASE WHEN $7 THEN NOW() ELSE completed_at END,
                updated_at = NOW()
            WHERE intent_id = $1
              AND status = $2
              AND confirmation_attempts = $3
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(intent_id)
        .bind(expected.status.as_str())
        .bind(expected.confirmation_attempts)
        .bind(transition.to.as_str())
        .bind(&transition.last_error)
        .bind(i32::from(transition.bump_attempts))
        .bind(transition.to.is_terminal())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(CasResult::Applied(row.try_into()?)),
            None => Ok(CasResult::Conflict),
        }
    }

    async fn list_stale(
        &self,
        updated_before: OffsetDateTime,
        limit: i64,
    ) -> PaymentResult<Vec<PaymentIntent>> {
        let rows: Vec<IntentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INTENT_COLUMNS} FROM payment_intents
            WHERE status NOT IN ('succeeded', 'failed', 'canceled')
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PaymentIntent::try_from).collect()
    }
}

#[async_trait]
impl SideEffectStore for PgPaymentStore {
    async fn activate_once(
        &self,
        intent_id: &str,
        target: Target,
    ) -> PaymentResult<ActivationOutcome> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(String, bool)> = sqlx::query_as(
            "SELECT status, side_effect_fired FROM payment_intents WHERE intent_id = $1 FOR UPDATE",
        )
        .bind(intent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, fired)) = locked else {
            return Err(PaymentError::NotFound(format!("payment intent {intent_id}")));
        };
        if fired {
            tx.rollback().await?;
            return Ok(ActivationOutcome::AlreadyFired);
        }
        let status: IntentStatus = status.parse()?;
        if status != IntentStatus::Succeeded {
            tx.rollback().await?;
            return Err(PaymentError::Internal(format!(
                "refusing to activate {target} for {status} intent {intent_id}"
            )));
        }
        if !target.is_some() {
            tx.rollback().await?;
            return Ok(ActivationOutcome::NotApplicable);
        }

        let outcome = if Self::activate_target(&mut tx, target).await? {
            sqlx::query(
                r#"
                UPDATE payment_intents
                SET side_effect_fired = TRUE, side_effect_fired_at = NOW(), updated_at = NOW()
                WHERE intent_id = $1 AND status = 'succeeded' AND side_effect_fired = FALSE
                "#,
            )
            .bind(intent_id)
            .execute(&mut *tx)
            .await?;
            ActivationOutcome::Activated
        } else {
            sqlx::query(
                "UPDATE payment_intents SET last_error = $2, updated_at = NOW() WHERE intent_id = $1",
            )
            .bind(intent_id)
            .bind(format!("side effect target missing: {target}"))
            .execute(&mut *tx)
            .await?;
            ActivationOutcome::TargetMissing
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl WebhookEventLog for PgPaymentStore {
    async fn append(&self, event: NewWebhookEvent) -> PaymentResult<WebhookEvent> {
        let row: WebhookRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events (id, event_type, intent_id, payload, secret_header)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {WEBHOOK_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&event.event_type)
        .bind(&event.intent_id)
        .bind(&event.payload)
        .bind(&event.secret_header)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn complete(
        &self,
        id: Uuid,
        processed: bool,
        processing_error: Option<&str>,
    ) -> PaymentResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = $2, processing_error = $3, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(processed)
        .bind(processing_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PaymentError::NotFound(format!("webhook event {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> PaymentResult<Option<WebhookEvent>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn recent(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhook_events ORDER BY received_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_replayable(&self, limit: i64) -> PaymentResult<Vec<WebhookEvent>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            r#"
            SELECT {WEBHOOK_COLUMNS} FROM webhook_events
            WHERE processed = FALSE
              AND processing_error IS DISTINCT FROM $1
            ORDER BY received_at ASC
            LIMIT $2
            "#
        ))
        .bind(SECRET_MISMATCH_ERROR)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
