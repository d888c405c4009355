//! Side-effect dispatcher
//!
//! Turns a succeeded payment into its domain action: a paid listing goes
//! live or an ad slot is enabled. The activation and the intent's
//! side-effect marker are written by [`SideEffectStore::activate_once`] as one
//! unit, so the action fires at most once per intent no matter how many
//! deliveries or pollers reach this point.

use std::sync::Arc;

use crate::error::PaymentResult;
use crate::intent::{IntentStatus, PaymentIntent, Target};
use crate::store::{ActivationOutcome, SideEffectStore};

#[derive(Clone)]
pub struct SideEffectDispatcher {
    store: Arc<dyn SideEffectStore>,
}

impl SideEffectDispatcher {
    pub fn new(store: Arc<dyn SideEffectStore>) -> Self {
        Self { store }
    }

    /// Fire the side effect bound to a succeeded intent
    ///
    /// A missing target is an anomaly, not an error: the payment did succeed,
    /// so the webhook is still acknowledged.
    pub async fn dispatch(&self, intent: &PaymentIntent) -> PaymentResult<ActivationOutcome> {
        if intent.target == Target::None {
            return Ok(ActivationOutcome::NotApplicable);
        }
        if intent.status != IntentStatus::Succeeded {
            tracing::warn!(
                intent_id = %intent.intent_id,
                status = %intent.status,
                "Side effect requested for an intent that has not succeeded - skipping"
            );
            return Ok(ActivationOutcome::NotApplicable);
        }
        if intent.side_effect_fired {
            return Ok(ActivationOutcome::AlreadyFired);
        }

        let outcome = self
            .store
            .activate_once(&intent.intent_id, intent.target)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    intent_id = %intent.intent_id,
                    target = %intent.target,
                    error = %e,
                    "Side effect activation failed"
                );
            })?;

        match outcome {
            ActivationOutcome::Activated => {
                tracing::info!(
                    intent_id = %intent.intent_id,
                    target = %intent.target,
                    amount_cents = intent.amount_cents,
                    currency = %intent.currency,
                    "Activated paid target"
                );
            }
            ActivationOutcome::AlreadyFired => {
                tracing::info!(
                    intent_id = %intent.intent_id,
                    target = %intent.target,
                    "Side effect already fired by a concurrent reconciliation"
                );
            }
            ActivationOutcome::TargetMissing => {
                tracing::warn!(
                    intent_id = %intent.intent_id,
                    target = %intent.target,
                    anomaly = "side_effect_target_missing",
                    "Paid target no longer exists - payment kept as succeeded"
                );
            }
            ActivationOutcome::NotApplicable => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Actor, Currency, NewPaymentIntent};
    use crate::machine::Transition;
    use crate::memory::MemoryStore;
    use crate::store::{CasResult, PaymentIntentStore};

    async fn succeeded_intent(store: &MemoryStore, target: Target) -> PaymentIntent {
        let created = store
            .insert(NewPaymentIntent {
                intent_id: "pi_dispatch".into(),
                amount_cents: 2500,
                currency: Currency::new("CRC").unwrap(),
                status: IntentStatus::RequiresConfirmation,
                description: "Featured listing".into(),
                target,
                actor: Actor::default(),
                metadata: Default::default(),
            })
            .await
            .unwrap();
        let transition = Transition {
            from: created.status,
            to: IntentStatus::Succeeded,
            last_error: None,
            bump_attempts: false,
            fire_side_effect: true,
            confirmation_timeout: false,
        };
        match store
            .compare_and_set("pi_dispatch", &created.snapshot(), &transition)
            .await
            .unwrap()
        {
            CasResult::Applied(row) => row,
            CasResult::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn activates_listing_once() {
        let store = MemoryStore::new();
        store.add_listing(42).await;
        let intent = succeeded_intent(&store, Target::Listing(42)).await;
        let dispatcher = SideEffectDispatcher::new(Arc::new(store.clone()));

        assert_eq!(
            dispatcher.dispatch(&intent).await.unwrap(),
            ActivationOutcome::Activated
        );
        // Stale copy of the row still says "not fired"; the store decides.
        assert_eq!(
            dispatcher.dispatch(&intent).await.unwrap(),
            ActivationOutcome::AlreadyFired
        );
        assert!(store.is_active(Target::Listing(42)).await);
        assert_eq!(store.activation_writes().await, 1);
    }

    #[tokio::test]
    async fn missing_target_is_not_an_error() {
        let store = MemoryStore::new();
        let intent = succeeded_intent(&store, Target::AdSlot(7)).await;
        let dispatcher = SideEffectDispatcher::new(Arc::new(store.clone()));

        assert_eq!(
            dispatcher.dispatch(&intent).await.unwrap(),
            ActivationOutcome::TargetMissing
        );
        let row = store.get("pi_dispatch").await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Succeeded);
        assert!(!row.side_effect_fired);
        assert!(row.last_error.unwrap().contains("ad_slot#7"));
    }

    #[tokio::test]
    async fn no_target_is_not_applicable() {
        let store = MemoryStore::new();
        let intent = succeeded_intent(&store, Target::None).await;
        let dispatcher = SideEffectDispatcher::new(Arc::new(store.clone()));
        assert_eq!(
            dispatcher.dispatch(&intent).await.unwrap(),
            ActivationOutcome::NotApplicable
        );
        assert_eq!(store.activation_writes().await, 0);
    }
}
