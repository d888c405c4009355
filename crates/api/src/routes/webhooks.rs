//! Payment gateway webhook routes

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use carmarket_payments::{IngestDisposition, WebhookEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Shared secret header sent by the gateway
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// Receive a gateway webhook
///
/// The body is taken as raw bytes so the exact payload is stored for replay
/// before anything is parsed, and so a non UTF-8 body still gets a JSON 400.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(body) = std::str::from_utf8(&body) else {
        tracing::warn!(payload_len = body.len(), "Rejected webhook with non UTF-8 body");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid webhook payload: body is not valid UTF-8" })),
        )
            .into_response();
    };
    let secret = headers.get(WEBHOOK_SECRET_HEADER).map(|v| v.as_bytes());

    let report = state.payments.ingest.ingest_raw(body, secret).await;

    match report.disposition {
        IngestDisposition::Acknowledged => (
            StatusCode::OK,
            Json(json!({ "received": true, "event_id": report.event_id })),
        )
            .into_response(),
        IngestDisposition::InvalidPayload => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": report.error.unwrap_or_else(|| "invalid payload".to_string())
            })),
        )
            .into_response(),
        IngestDisposition::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "webhook secret mismatch" })),
        )
            .into_response(),
        // Detail stays in the logs and the webhook row
        IngestDisposition::RetryLater => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "processing failed, retry later" })),
        )
            .into_response(),
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// Delivery as shown in the history listing; the secret itself is withheld
#[derive(Debug, Serialize)]
pub struct WebhookHistoryEntry {
    pub id: Uuid,
    pub event_type: String,
    pub intent_id: Option<String>,
    pub payload: String,
    pub secret_present: bool,
    pub processed: bool,
    pub processing_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

impl From<WebhookEvent> for WebhookHistoryEntry {
    fn from(event: WebhookEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            intent_id: event.intent_id,
            payload: event.payload,
            secret_present: event.secret_header.is_some(),
            processed: event.processed,
            processing_error: event.processing_error,
            received_at: event.received_at,
            processed_at: event.processed_at,
        }
    }
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<WebhookHistoryEntry>>> {
    let events = state.payments.ingest.history(query.limit).await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request, StatusCode};
    use carmarket_payments::{MemoryStore, PaymentIntentStore, Target};

    use super::WEBHOOK_SECRET_HEADER;
    use crate::routes::test_support::{app, send, SECRET};

    fn webhook(body: &str, secret: Option<&str>) -> Request<Body> {
        let secret = secret.map(|s| HeaderValue::from_str(s).unwrap());
        raw_webhook(body.as_bytes().to_vec(), secret)
    }

    fn raw_webhook(body: Vec<u8>, secret: Option<HeaderValue>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/payments")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(WEBHOOK_SECRET_HEADER, secret);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn create(app: &axum::Router) -> String {
        let (status, body) = send(
            app,
            Request::builder()
                .method("POST")
                .uri("/payments/create-intent")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"amount":2500,"currency":"crc","description":"Destacar","target":{"kind":"listing","id":42}}"#,
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["intent_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(&MemoryStore::new());
        let (status, body) = send(
            &app,
            Request::get("/webhooks/payments/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn succeeded_webhook_activates_listing() {
        let store = MemoryStore::new();
        store.add_listing(42).await;
        let app = app(&store);
        let intent_id = create(&app).await;

        let payload = format!(r#"{{"type":"payment-intent.succeeded","data":{{"id":"{intent_id}"}}}}"#);
        let (status, body) = send(&app, webhook(&payload, Some(SECRET))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);

        assert!(store.is_active(Target::Listing(42)).await);
        let row = store.get(&intent_id).await.unwrap().unwrap();
        assert!(row.side_effect_fired);

        // Redelivery is acknowledged without another activation
        let (status, _) = send(&app, webhook(&payload, Some(SECRET))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(store.activation_writes().await, 1);
    }

    #[tokio::test]
    async fn malformed_webhook_is_bad_request() {
        let store = MemoryStore::new();
        let app = app(&store);

        for body in ["", "{not json", r#"{"type":"payment-intent.succeeded","data":{}}"#] {
            let (status, json) = send(&app, webhook(body, Some(SECRET))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
            assert!(json["error"].is_string());
        }
        assert_eq!(store.webhook_event_count().await, 0);
    }

    #[tokio::test]
    async fn non_utf8_body_is_json_bad_request() {
        let store = MemoryStore::new();
        let app = app(&store);

        let (status, json) = send(&app, raw_webhook(vec![0x7b, 0xff, 0xfe, 0x7d], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("UTF-8"));
        assert_eq!(store.webhook_event_count().await, 0);
    }

    #[tokio::test]
    async fn non_ascii_secret_is_stored_and_rejected() {
        let store = MemoryStore::new();
        store.add_listing(42).await;
        let app = app(&store);
        let intent_id = create(&app).await;

        let payload = format!(r#"{{"type":"payment-intent.succeeded","data":{{"id":"{intent_id}"}}}}"#);
        let secret = HeaderValue::from_bytes(&[0x77, 0xe9, 0x62]).unwrap();
        let (status, _) = send(&app, raw_webhook(payload.into_bytes(), Some(secret))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!store.is_active(Target::Listing(42)).await);

        let (_, history) = send(
            &app,
            Request::get("/webhooks/payments/history")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(history[0]["secret_present"], true);
        assert_eq!(history[0]["processing_error"], "webhook secret mismatch");
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let store = MemoryStore::new();
        store.add_listing(42).await;
        let app = app(&store);
        let intent_id = create(&app).await;

        let payload = format!(r#"{{"type":"payment-intent.succeeded","data":{{"id":"{intent_id}"}}}}"#);
        let (status, _) = send(&app, webhook(&payload, Some("guess"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!store.is_active(Target::Listing(42)).await);
        assert_eq!(store.webhook_event_count().await, 1);
    }

    #[tokio::test]
    async fn transient_failure_asks_for_redelivery() {
        let store = MemoryStore::new();
        store.add_listing(42).await;
        let app = app(&store);
        let intent_id = create(&app).await;
        store.fail_next_activations(1).await;

        let payload = format!(r#"{{"type":"payment-intent.succeeded","data":{{"id":"{intent_id}"}}}}"#);
        let (status, _) = send(&app, webhook(&payload, Some(SECRET))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = send(&app, webhook(&payload, Some(SECRET))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(store.is_active(Target::Listing(42)).await);
    }

    #[tokio::test]
    async fn history_hides_secret_and_caps_limit() {
        let store = MemoryStore::new();
        let app = app(&store);
        for i in 0..3 {
            let payload = format!(r#"{{"type":"mobile-transfer.received","data":{{"id":"mt_{i}"}}}}"#);
            send(&app, webhook(&payload, Some(SECRET))).await;
        }

        let (status, body) = send(
            &app,
            Request::get("/webhooks/payments/history?limit=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0]["payload"].as_str().unwrap().contains("mt_2"));
        assert_eq!(rows[0]["secret_present"], true);
        assert!(rows[0].get("secret_header").is_none());
    }
}
