//! Reconciliation engine
//!
//! Applies gateway observations (from webhooks or the status poller) to the
//! locally persisted intent. Each round reads the row, asks the pure state
//! machine what to do, and applies the answer with a compare-and-swap. A lost
//! swap means another writer moved the row first; the engine re-reads and
//! decides again, so the loser of a webhook/poller race ends up as a no-op.

use std::fmt;
use std::sync::Arc;

use crate::config::ReconcileConfig;
use crate::dispatcher::SideEffectDispatcher;
use crate::error::{PaymentError, PaymentResult};
use crate::intent::IntentStatus;
use crate::machine::{decide, Decision, IgnoreReason, Observation};
use crate::store::{ActivationOutcome, CasResult, PaymentIntentStore};

/// Which path delivered the observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    Webhook,
    Poller,
    Replay,
}

impl fmt::Display for ReconcileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileSource::Webhook => "webhook",
            ReconcileSource::Poller => "poller",
            ReconcileSource::Replay => "replay",
        })
    }
}

/// Resolved result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Transitioned {
        from: IntentStatus,
        to: IntentStatus,
        side_effect: ActivationOutcome,
    },
    /// Escalated to `failed` after too many deferrals
    ConfirmationTimeout { attempts: i32 },
    /// Intent was already succeeded; the pending side effect was retried
    SideEffectRetried(ActivationOutcome),
    Duplicate,
    TerminalSticky { status: IntentStatus },
    RegressionRejected {
        current: IntentStatus,
        attempted: IntentStatus,
    },
    UnknownIntent,
}

impl ReconcileOutcome {
    /// Anomaly note worth keeping on the webhook row, if any
    pub fn anomaly(&self) -> Option<String> {
        match self {
            ReconcileOutcome::RegressionRejected { current, attempted } => Some(format!(
                "regression rejected: {current} -> {attempted}"
            )),
            ReconcileOutcome::Transitioned {
                side_effect: ActivationOutcome::TargetMissing,
                ..
            }
            | ReconcileOutcome::SideEffectRetried(ActivationOutcome::TargetMissing) => {
                Some("side effect target missing".to_string())
            }
            ReconcileOutcome::UnknownIntent => Some("unknown intent".to_string()),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    intents: Arc<dyn PaymentIntentStore>,
    dispatcher: SideEffectDispatcher,
    config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(
        intents: Arc<dyn PaymentIntentStore>,
        dispatcher: SideEffectDispatcher,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            intents,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Reconcile one observation for `intent_id`
    ///
    /// Errors are transient (storage or side-effect failures, or losing the
    /// swap more than `cas_retries` times) and mean the caller should retry.
    pub async fn reconcile(
        &self,
        intent_id: &str,
        observation: &Observation,
        source: ReconcileSource,
    ) -> PaymentResult<ReconcileOutcome> {
        for round in 0..=self.config.cas_retries {
            let Some(intent) = self.intents.get(intent_id).await? else {
                tracing::info!(
                    intent_id = %intent_id,
                    source = %source,
                    "Observation for unknown payment intent - acknowledged without mutation"
                );
                return Ok(ReconcileOutcome::UnknownIntent);
            };

            let snapshot = intent.snapshot();
            let decision = decide(
                &snapshot,
                observation,
                self.config.max_confirmation_attempts,
            );

            match decision {
                Decision::Ignore(IgnoreReason::Duplicate) => {
                    tracing::info!(
                        intent_id = %intent_id,
                        status = %intent.status,
                        source = %source,
                        "Duplicate observation - already applied"
                    );
                    return Ok(ReconcileOutcome::Duplicate);
                }
                Decision::Ignore(IgnoreReason::TerminalSticky) => {
                    tracing::info!(
                        intent_id = %intent_id,
                        status = %intent.status,
                        source = %source,
                        "Late non-terminal observation for terminal intent - ignored"
                    );
                    return Ok(ReconcileOutcome::TerminalSticky {
                        status: intent.status,
                    });
                }
                Decision::Reject { current, attempted } => {
                    tracing::warn!(
                        intent_id = %intent_id,
                        current = %current,
                        attempted = %attempted,
                        source = %source,
                        anomaly = "regression_rejected",
                        "Refusing to move payment intent out of a terminal state"
                    );
                    return Ok(ReconcileOutcome::RegressionRejected { current, attempted });
                }
                Decision::RetrySideEffect => {
                    tracing::info!(
                        intent_id = %intent_id,
                        target = %intent.target,
                        source = %source,
                        "Intent already succeeded with pending side effect - retrying activation"
                    );
                    let outcome = self.dispatcher.dispatch(&intent).await?;
                    return Ok(ReconcileOutcome::SideEffectRetried(outcome));
                }
                Decision::Advance(transition) => {
                    match self
                        .intents
                        .compare_and_set(intent_id, &snapshot, &transition)
                        .await?
                    {
                        CasResult::Applied(updated) => {
                            tracing::info!(
                                intent_id = %intent_id,
                                from = %transition.from,
                                to = %transition.to,
                                attempts = updated.confirmation_attempts,
                                source = %source,
                                "Payment intent transitioned"
                            );

                            if transition.confirmation_timeout {
                                tracing::warn!(
                                    intent_id = %intent_id,
                                    attempts = updated.confirmation_attempts,
                                    "Payment intent exceeded confirmation attempts - marked failed"
                                );
                                return Ok(ReconcileOutcome::ConfirmationTimeout {
                                    attempts: updated.confirmation_attempts,
                                });
                            }

                            let side_effect = if transition.fire_side_effect {
                                self.dispatcher.dispatch(&updated).await?
                            } else {
                                ActivationOutcome::NotApplicable
                            };

                            return Ok(ReconcileOutcome::Transitioned {
                                from: transition.from,
                                to: transition.to,
                                side_effect,
                            });
                        }
                        CasResult::Conflict => {
                            tracing::debug!(
                                intent_id = %intent_id,
                                round = round,
                                source = %source,
                                "Lost compare-and-swap to a concurrent writer - re-reading"
                            );
                        }
                    }
                }
            }
        }

        tracing::error!(
            intent_id = %intent_id,
            retries = self.config.cas_retries,
            source = %source,
            "Gave up reconciling payment intent after repeated concurrent modifications"
        );
        Err(PaymentError::ConcurrentModification(intent_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Actor, Currency, NewPaymentIntent, Target};
    use crate::memory::MemoryStore;

    async fn setup(target: Target) -> (MemoryStore, ReconciliationEngine) {
        let store = MemoryStore::new();
        if let Target::Listing(id) = target {
            store.add_listing(id).await;
        }
        store
            .insert(NewPaymentIntent {
                intent_id: "pi_engine".into(),
                amount_cents: 2500,
                currency: Currency::new("CRC").unwrap(),
                status: IntentStatus::RequiresConfirmation,
                description: "Listing upgrade".into(),
                target,
                actor: Actor::default(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let engine = ReconciliationEngine::new(
            Arc::new(store.clone()),
            SideEffectDispatcher::new(Arc::new(store.clone())),
            ReconcileConfig {
                max_confirmation_attempts: 2,
                cas_retries: 3,
            },
        );
        (store, engine)
    }

    #[tokio::test]
    async fn success_transitions_and_activates() {
        let (store, engine) = setup(Target::Listing(42)).await;
        let outcome = engine
            .reconcile("pi_engine", &Observation::Succeeded, ReconcileSource::Webhook)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Transitioned {
                from: IntentStatus::RequiresConfirmation,
                to: IntentStatus::Succeeded,
                side_effect: ActivationOutcome::Activated,
            }
        );
        let row = store.get("pi_engine").await.unwrap().unwrap();
        assert!(row.side_effect_fired);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_intent_is_acknowledged() {
        let (_store, engine) = setup(Target::None).await;
        let outcome = engine
            .reconcile("pi_missing", &Observation::Succeeded, ReconcileSource::Webhook)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::UnknownIntent);
    }

    #[tokio::test]
    async fn deferrals_escalate_to_timeout() {
        let (store, engine) = setup(Target::Listing(1)).await;
        for _ in 0..2 {
            let outcome = engine
                .reconcile("pi_engine", &Observation::Deferred, ReconcileSource::Poller)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                ReconcileOutcome::Transitioned {
                    to: IntentStatus::Processing,
                    ..
                }
            ));
        }
        let outcome = engine
            .reconcile("pi_engine", &Observation::Deferred, ReconcileSource::Poller)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ConfirmationTimeout { attempts: 3 });

        let row = store.get("pi_engine").await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Failed);
        assert_eq!(
            row.last_error.as_deref(),
            Some("confirmation timeout after 3 attempts")
        );
        assert!(!store.is_active(Target::Listing(1)).await);
    }

    #[tokio::test]
    async fn failed_activation_is_retried_on_next_delivery() {
        let (store, engine) = setup(Target::Listing(42)).await;
        store.fail_next_activations(1).await;

        let err = engine
            .reconcile("pi_engine", &Observation::Succeeded, ReconcileSource::Webhook)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let row = store.get("pi_engine").await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Succeeded);
        assert!(!row.side_effect_fired);

        let outcome = engine
            .reconcile("pi_engine", &Observation::Succeeded, ReconcileSource::Webhook)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::SideEffectRetried(ActivationOutcome::Activated)
        );
        assert_eq!(store.activation_writes().await, 1);
    }

    #[test]
    fn anomaly_notes() {
        assert_eq!(
            ReconcileOutcome::RegressionRejected {
                current: IntentStatus::Succeeded,
                attempted: IntentStatus::Failed
            }
            .anomaly()
            .as_deref(),
            Some("regression rejected: succeeded -> failed")
        );
        assert_eq!(ReconcileOutcome::Duplicate.anomaly(), None);
    }
}
