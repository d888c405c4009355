//! Payment gateway client
//!
//! Creates intents and reads their authoritative status over HTTPS. Calls are
//! retried with exponential backoff on connection errors, 429 and 5xx; other
//! 4xx answers are returned immediately. Intent creation sends an
//! `Idempotency-Key` so a retried create cannot open a second intent.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{PaymentError, PaymentResult};
use crate::events::GatewayErrorDetail;
use crate::machine::Observation;

/// Gateway-side status of an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    RequiresConfirmation,
    RequiresPaymentMethod,
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

/// Intent as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayIntent {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub status: GatewayStatus,
    #[serde(default, alias = "last_payment_error")]
    pub last_payment_error: Option<GatewayErrorDetail>,
}

impl GatewayIntent {
    /// Observation fed to the reconciliation engine
    ///
    /// Every non-terminal gateway status counts as a deferral, so an intent
    /// that never resolves eventually reaches the confirmation ceiling.
    pub fn observation(&self) -> Observation {
        match self.status {
            GatewayStatus::Succeeded => Observation::Succeeded,
            GatewayStatus::Failed => Observation::Failed {
                error: self
                    .last_payment_error
                    .as_ref()
                    .map(GatewayErrorDetail::describe)
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            GatewayStatus::Canceled => Observation::Canceled,
            GatewayStatus::RequiresConfirmation
            | GatewayStatus::RequiresPaymentMethod
            | GatewayStatus::RequiresAction
            | GatewayStatus::Processing
            | GatewayStatus::Unknown => Observation::Deferred,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIntentParams {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_intent(&self, params: &CreateIntentParams) -> PaymentResult<GatewayIntent>;

    async fn fetch_intent(&self, intent_id: &str) -> PaymentResult<GatewayIntent>;
}

/// Failure of a single HTTP attempt
struct AttemptError {
    retryable: bool,
    error: PaymentError,
}

/// reqwest-backed gateway client
#[derive(Clone)]
pub struct HttpGatewayClient {
    http: Client,
    config: GatewayConfig,
}

impl HttpGatewayClient {
    pub fn new(config: GatewayConfig) -> PaymentResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries)
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&CreateIntentParams>,
        idempotency_key: Option<&str>,
    ) -> Result<T, AttemptError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.config.secret_key);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| AttemptError {
            retryable: e.is_connect() || e.is_timeout() || e.is_request(),
            error: PaymentError::Gateway(format!("request to {path} failed: {e}")),
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptError {
                retryable: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
                error: if status == StatusCode::NOT_FOUND {
                    PaymentError::NotFound(format!("gateway resource {path}"))
                } else {
                    PaymentError::Gateway(format!("{path} returned {status}: {text}"))
                },
            });
        }

        response.json::<T>().await.map_err(|e| AttemptError {
            retryable: false,
            error: PaymentError::Gateway(format!("unexpected response from {path}: {e}")),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&CreateIntentParams>,
        idempotency_key: Option<&str>,
    ) -> PaymentResult<T> {
        RetryIf::spawn(
            self.backoff(),
            || {
                let method = method.clone();
                async move {
                    let result = self.send_once(method, path, body, idempotency_key).await;
                    if let Err(e) = &result {
                        if e.retryable {
                            tracing::warn!(path = %path, error = %e.error, "Gateway call failed, will retry");
                        }
                    }
                    result
                }
            },
            |e: &AttemptError| e.retryable,
        )
        .await
        .map_err(|e| e.error)
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn create_intent(&self, params: &CreateIntentParams) -> PaymentResult<GatewayIntent> {
        let idempotency_key = Uuid::new_v4().to_string();
        let intent: GatewayIntent = self
            .call(
                Method::POST,
                "/payment-intents",
                Some(params),
                Some(&idempotency_key),
            )
            .await?;
        tracing::info!(
            intent_id = %intent.id,
            amount_cents = params.amount,
            currency = %params.currency,
            "Created gateway payment intent"
        );
        Ok(intent)
    }

    async fn fetch_intent(&self, intent_id: &str) -> PaymentResult<GatewayIntent> {
        let path = format!("/payment-intents/{intent_id}");
        self.call(Method::GET, &path, None, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: String) -> HttpGatewayClient {
        HttpGatewayClient::new(GatewayConfig {
            base_url,
            secret_key: "sk_test_123".into(),
            publishable_key: "pk_test_123".into(),
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_maps_failed_status_to_observation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/payment-intents/pi_1")
            .match_header("authorization", "Bearer sk_test_123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"pi_1","amount":2500,"currency":"CRC","status":"failed","lastPaymentError":{"message":"Fondos insuficientes"}}"#,
            )
            .create_async()
            .await;

        let intent = client(server.url()).fetch_intent("pi_1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(intent.status, GatewayStatus::Failed);
        assert_eq!(
            intent.observation(),
            Observation::Failed {
                error: "Fondos insuficientes".into()
            }
        );
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/payment-intents/pi_2")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client(server.url()).fetch_intent("pi_2").await.unwrap_err();
        failing.assert_async().await;
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let missing = server
            .mock("GET", "/payment-intents/pi_3")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client(server.url()).fetch_intent("pi_3").await.unwrap_err();
        missing.assert_async().await;
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_sends_idempotency_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment-intents")
            .match_header("idempotency-key", mockito::Matcher::Any)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "amount": 2500,
                "currency": "CRC"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"pi_new","amount":2500,"currency":"CRC","status":"requires_confirmation"}"#)
            .create_async()
            .await;

        let intent = client(server.url())
            .create_intent(&CreateIntentParams {
                amount: 2500,
                currency: "CRC".into(),
                description: "Destacar anuncio".into(),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(intent.id, "pi_new");
        assert_eq!(intent.status, GatewayStatus::RequiresConfirmation);
    }

    #[test]
    fn pending_statuses_are_deferrals() {
        for status in ["processing", "requires_action", "requires_payment_method", "on_hold"] {
            let intent: GatewayIntent =
                serde_json::from_str(&format!(r#"{{"id":"pi","status":"{status}"}}"#)).unwrap();
            assert_eq!(intent.observation(), Observation::Deferred, "{status}");
        }
    }
}
