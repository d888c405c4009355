//! Payment error types

use thiserror::Error;

/// Result alias used throughout the payments crate
pub type PaymentResult<T> = Result<T, PaymentError>;

/// Errors raised by the payment lifecycle
///
/// Only conditions that a redelivery could fix are errors. Outcomes such as an
/// unknown intent or a rejected regression are reported through
/// [`crate::engine::ReconcileOutcome`] instead.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Webhook body was empty or did not match the `{type, data:{id}}` envelope
    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    /// Shared-secret header did not match the configured webhook secret
    #[error("Webhook secret mismatch")]
    WebhookSecretMismatch,

    /// Caller supplied a bad amount, currency or target
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An intent with this gateway id is already recorded
    #[error("Payment intent already exists: {0}")]
    DuplicateIntent(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Gateway answered with an error or could not be reached
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Concurrent modification of payment intent {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Whether the failure is transient and the gateway should redeliver
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PaymentError::Database(_)
                | PaymentError::Gateway(_)
                | PaymentError::ConcurrentModification(_)
                | PaymentError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => PaymentError::NotFound("row not found".to_string()),
            other => PaymentError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(e: reqwest::Error) -> Self {
        PaymentError::Gateway(e.to_string())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        PaymentError::InvalidPayload(e.to_string())
    }
}
