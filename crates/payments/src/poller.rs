//! Status poller
//!
//! Liveness backstop for lost webhooks. Each cycle picks intents that have
//! sat in a non-terminal status longer than the stale threshold, asks the
//! gateway for their real status and pushes the answer through the same
//! reconciliation engine the webhook path uses.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::PollerConfig;
use crate::engine::{ReconcileOutcome, ReconcileSource, ReconciliationEngine};
use crate::error::{PaymentError, PaymentResult};
use crate::gateway::GatewayClient;
use crate::store::PaymentIntentStore;

/// Counts for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub examined: usize,
    pub transitioned: usize,
    pub timed_out: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct StatusPoller {
    intents: Arc<dyn PaymentIntentStore>,
    gateway: Arc<dyn GatewayClient>,
    engine: ReconciliationEngine,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(
        intents: Arc<dyn PaymentIntentStore>,
        gateway: Arc<dyn GatewayClient>,
        engine: ReconciliationEngine,
        config: PollerConfig,
    ) -> Self {
        Self {
            intents,
            gateway,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run a single poll cycle
    pub async fn run_once(&self) -> PaymentResult<PollSummary> {
        let stale_after = time::Duration::try_from(self.config.stale_after)
            .map_err(|e| PaymentError::Config(format!("invalid stale threshold: {e}")))?;
        let cutoff = OffsetDateTime::now_utc() - stale_after;
        let stale = self
            .intents
            .list_stale(cutoff, self.config.batch_size)
            .await?;

        let mut summary = PollSummary {
            examined: stale.len(),
            ..Default::default()
        };

        for intent in stale {
            let gateway_intent = match self.gateway.fetch_intent(&intent.intent_id).await {
                Ok(gateway_intent) => gateway_intent,
                Err(e) => {
                    tracing::error!(
                        intent_id = %intent.intent_id,
                        error = %e,
                        "Failed to fetch intent status from gateway"
                    );
                    summary.errors += 1;
                    continue;
                }
            };

            let observation = gateway_intent.observation();
            match self
                .engine
                .reconcile(&intent.intent_id, &observation, ReconcileSource::Poller)
                .await
            {
                Ok(ReconcileOutcome::Transitioned { from, to, .. }) if from != to => {
                    summary.transitioned += 1;
                }
                Ok(ReconcileOutcome::ConfirmationTimeout { .. }) => summary.timed_out += 1,
                Ok(_) => summary.unchanged += 1,
                Err(e) => {
                    tracing::error!(
                        intent_id = %intent.intent_id,
                        error = %e,
                        "Failed to reconcile polled intent"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            examined = summary.examined,
            transitioned = summary.transitioned,
            timed_out = summary.timed_out,
            unchanged = summary.unchanged,
            errors = summary.errors,
            "Status poll cycle complete"
        );

        Ok(summary)
    }

    /// Poll forever on the configured interval
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "Status poll cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::ReconcileConfig;
    use crate::dispatcher::SideEffectDispatcher;
    use crate::gateway::{CreateIntentParams, GatewayIntent, GatewayStatus};
    use crate::intent::{Actor, Currency, IntentStatus, NewPaymentIntent, Target};
    use crate::memory::MemoryStore;

    struct ScriptedGateway(HashMap<String, GatewayStatus>);

    #[async_trait]
    impl GatewayClient for ScriptedGateway {
        async fn create_intent(&self, _params: &CreateIntentParams) -> PaymentResult<GatewayIntent> {
            Err(PaymentError::Gateway("not used".into()))
        }

        async fn fetch_intent(&self, intent_id: &str) -> PaymentResult<GatewayIntent> {
            let status = self
                .0
                .get(intent_id)
                .copied()
                .ok_or_else(|| PaymentError::Gateway("unreachable".into()))?;
            Ok(GatewayIntent {
                id: intent_id.to_string(),
                amount: None,
                currency: None,
                status,
                last_payment_error: None,
            })
        }
    }

    async fn insert(store: &MemoryStore, id: &str, target: Target) {
        store
            .insert(NewPaymentIntent {
                intent_id: id.into(),
                amount_cents: 1000,
                currency: Currency::new("CRC").unwrap(),
                status: IntentStatus::RequiresConfirmation,
                description: "poll".into(),
                target,
                actor: Actor::default(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    fn poller(store: &MemoryStore, statuses: &[(&str, GatewayStatus)], ceiling: i32) -> StatusPoller {
        let engine = ReconciliationEngine::new(
            Arc::new(store.clone()),
            SideEffectDispatcher::new(Arc::new(store.clone())),
            ReconcileConfig {
                max_confirmation_attempts: ceiling,
                cas_retries: 3,
            },
        );
        StatusPoller::new(
            Arc::new(store.clone()),
            Arc::new(ScriptedGateway(
                statuses
                    .iter()
                    .map(|(id, s)| (id.to_string(), *s))
                    .collect(),
            )),
            engine,
            PollerConfig {
                interval: Duration::from_secs(60),
                stale_after: Duration::ZERO,
                batch_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn closes_gap_left_by_lost_webhook() {
        let store = MemoryStore::new();
        store.add_listing(5).await;
        insert(&store, "pi_lost", Target::Listing(5)).await;
        insert(&store, "pi_down", Target::None).await;

        let summary = poller(
            &store,
            &[("pi_lost", GatewayStatus::Succeeded)],
            5,
        )
        .run_once()
        .await
        .unwrap();

        assert_eq!(summary.examined, 2);
        assert_eq!(summary.transitioned, 1);
        assert_eq!(summary.errors, 1);
        assert!(store.is_active(Target::Listing(5)).await);
    }

    #[tokio::test]
    async fn never_resolving_intent_times_out() {
        let store = MemoryStore::new();
        insert(&store, "pi_stuck", Target::None).await;
        let poller = poller(&store, &[("pi_stuck", GatewayStatus::RequiresPaymentMethod)], 2);

        for _ in 0..2 {
            poller.run_once().await.unwrap();
        }
        let summary = poller.run_once().await.unwrap();
        assert_eq!(summary.timed_out, 1);

        let row = store.get("pi_stuck").await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Failed);

        // Terminal intents are no longer polled
        assert_eq!(poller.run_once().await.unwrap().examined, 0);
    }
}
