// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Carmarket Payments
//!
//! Payment intent lifecycle and webhook reconciliation for the marketplace.
//!
//! ## Features
//!
//! - **Checkout**: Open gateway payment intents for listings and ad slots
//! - **Webhooks**: Persist every delivery, then reconcile it against the intent
//! - **State Machine**: Monotonic intent transitions decided by a pure function
//! - **Side Effects**: Activate the purchased listing or ad slot exactly once
//! - **Status Poller**: Recover intents whose webhook never arrived
//! - **Replay**: Re-run stored deliveries that failed transiently
//! - **Invariants**: Read-only consistency checks over the payment tables

pub mod checkout;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ingest;
pub mod intent;
pub mod invariants;
pub mod machine;
pub mod memory;
pub mod poller;
pub mod postgres;
pub mod store;


// Checkout
pub use checkout::{CheckoutService, CreateIntentRequest, CreatedIntent};

// Config
pub use config::{
    GatewayConfig, PaymentsConfig, PollerConfig, ReconcileConfig,
    DEFAULT_MAX_CONFIRMATION_ATTEMPTS,
};

// Dispatcher
pub use dispatcher::SideEffectDispatcher;

// Engine
pub use engine::{ReconcileOutcome, ReconcileSource, ReconciliationEngine};

// Error
pub use error::{PaymentError, PaymentResult};

// Events
pub use events::{GatewayEvent, WebhookEnvelope};

// Gateway
pub use gateway::{GatewayClient, GatewayIntent, GatewayStatus, HttpGatewayClient};

// Ingest
pub use ingest::{
    IngestDisposition, IngestReport, ProcessedEvent, WebhookIngestService, WebhookReplayResult,
};

// Intent
pub use intent::{Actor, Currency, IntentStatus, PaymentIntent, Target};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Machine
pub use machine::{decide, Decision, Observation};

// Poller
pub use poller::{PollSummary, StatusPoller};

// Stores
pub use memory::MemoryStore;
pub use postgres::{PgPaymentStore, MIGRATOR};
pub use store::{ActivationOutcome, PaymentIntentStore, SideEffectStore, WebhookEvent, WebhookEventLog};

use std::sync::Arc;

use sqlx::PgPool;

/// All payment services wired over one store and one gateway client
#[derive(Clone)]
pub struct PaymentsService {
    pub checkout: CheckoutService,
    pub engine: ReconciliationEngine,
    pub ingest: WebhookIngestService,
    pub poller: StatusPoller,
}

impl PaymentsService {
    /// Create the services from environment variables over Postgres
    pub fn from_env(pool: PgPool) -> PaymentResult<Self> {
        let config = PaymentsConfig::from_env()?;
        let gateway = HttpGatewayClient::new(config.gateway.clone())?;
        Ok(Self::new(PgPaymentStore::new(pool), Arc::new(gateway), config))
    }

    /// Create the services over an explicit store and gateway
    pub fn new<S>(store: S, gateway: Arc<dyn GatewayClient>, config: PaymentsConfig) -> Self
    where
        S: PaymentIntentStore + SideEffectStore + WebhookEventLog + Clone + 'static,
    {
        let intents: Arc<dyn PaymentIntentStore> = Arc::new(store.clone());
        let dispatcher = SideEffectDispatcher::new(Arc::new(store.clone()));
        let engine = ReconciliationEngine::new(intents.clone(), dispatcher, config.reconcile);

        Self {
            checkout: CheckoutService::new(
                gateway.clone(),
                intents.clone(),
                config.gateway.publishable_key,
                config.default_currency,
            ),
            ingest: WebhookIngestService::new(
                Arc::new(store),
                engine.clone(),
                config.webhook_secret,
            ),
            poller: StatusPoller::new(intents, gateway, engine.clone(), config.poller),
            engine,
        }
    }
}
