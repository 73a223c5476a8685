//! ==============================================================================
//! server.rs - http surface of the hub
//! ==============================================================================
//!
//! routes:
//!     POST /data/upload          signed reading from a device (200, empty body)
//!     GET  /data/summaries       roll-ups of one device, optional time window
//!     GET  /devices/:device_id   registry view of a device (secret never leaves)
//!     POST /data/analysis        ai report over a device's roll-ups
//!     GET  /health               liveness
//!
//! every failure is rendered through the same envelope:
//!     {"status": <code>, "kind": "...", "message": "...", "data": ...}
//!
//! ==============================================================================

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::analysis::{AnalysisRequest, Analyzer};
use crate::domain::UploadEnvelope;
use crate::error::{IngestError, IngestResult};
use crate::pipeline::Pipeline;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub analyzer: Arc<Analyzer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data/upload", post(upload_handler))
        .route("/data/summaries", get(summaries_handler))
        .route("/data/analysis", post(analysis_handler))
        .route("/devices/:device_id", get(device_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==============================================================================
// envelopes
// ==============================================================================

/// success envelope, status 0
fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "status": 0, "message": "ok", "data": data }))
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let data = match &self {
            IngestError::AnomalousReading(result) => json!({
                "anomaly_fields": result.anomaly_fields,
                "anomaly_details": result.anomaly_details,
            }),
            _ => Value::Null,
        };
        let body = json!({
            "status": self.code(),
            "kind": self.kind(),
            "message": self.to_string(),
            "data": data,
        });
        (self.http_status(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for IngestError {
    fn from(rejection: JsonRejection) -> Self {
        IngestError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for IngestError {
    fn from(rejection: QueryRejection) -> Self {
        IngestError::BadRequest(rejection.body_text())
    }
}

// ==============================================================================
// handlers
// ==============================================================================

async fn upload_handler(
    State(state): State<AppState>,
    body: Result<Json<UploadEnvelope>, JsonRejection>,
) -> IngestResult<StatusCode> {
    let Json(upload) = body?;
    match state.pipeline.ingest(&upload).await {
        Ok(outcome) => {
            if let Some(summary_id) = outcome.summary_id {
                tracing::debug!(
                    device_id = %upload.device_id,
                    record_id = outcome.record_id,
                    summary_id,
                    "upload closed a batch"
                );
            }
            Ok(StatusCode::OK)
        }
        Err(e) => {
            match &e {
                IngestError::StorageFailure(_) => {
                    tracing::error!(device_id = %upload.device_id, "upload failed: {}", e)
                }
                _ => {
                    tracing::warn!(
                        device_id = %upload.device_id,
                        kind = e.kind(),
                        "upload rejected"
                    )
                }
            }
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    device_id: String,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
}

async fn summaries_handler(
    State(state): State<AppState>,
    query: Result<Query<SummaryQuery>, QueryRejection>,
) -> IngestResult<Json<Value>> {
    let Query(q) = query?;
    let summaries = state
        .pipeline
        .storage()
        .summaries
        .list(
            &q.device_id,
            q.after.map(|t| t.timestamp()),
            q.before.map(|t| t.timestamp()),
        )
        .await?;
    Ok(ok(summaries))
}

async fn device_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> IngestResult<Json<Value>> {
    let device = state
        .pipeline
        .storage()
        .devices
        .find(&device_id)
        .await?
        .ok_or(IngestError::UnknownDevice)?;
    Ok(ok(device))
}

async fn analysis_handler(
    State(state): State<AppState>,
    body: Result<Json<AnalysisRequest>, JsonRejection>,
) -> IngestResult<Json<Value>> {
    let Json(request) = body?;
    let report = state.analyzer.analyze(&request).await?;
    Ok(ok(report))
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::StubGenerator;
    use crate::domain::{unix_now, Field, SummaryRecord};
    use crate::pipeline::tests::{normal_reading, pipeline, signed, DEVICE};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let pipeline = Arc::new(pipeline(10).await);
        let analyzer = Analyzer::new(
            pipeline.storage().clone(),
            Arc::new(StubGenerator::new(false)),
            "deepseek-chat",
        );
        AppState {
            pipeline,
            analyzer: Arc::new(analyzer),
        }
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = send(state, request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn accepted_upload_returns_empty_ok() {
        let state = state().await;
        let upload = serde_json::to_value(signed(unix_now(), normal_reading())).unwrap();
        let (status, body) = send(&state, post_json("/data/upload", &upload)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_404_with_envelope() {
        let state = state().await;
        let mut upload = serde_json::to_value(signed(unix_now(), normal_reading())).unwrap();
        upload["device_id"] = json!("ffffffffffffffff");
        let (status, body) = send_json(&state, post_json("/data/upload", &upload)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 12);
        assert_eq!(body["kind"], "unknown_device");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn anomalous_upload_lists_fields() {
        let state = state().await;
        let mut reading = normal_reading();
        reading.set(Field::Ozone, 99.0);
        let upload = serde_json::to_value(signed(unix_now(), reading)).unwrap();
        let (status, body) = send_json(&state, post_json("/data/upload", &upload)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], 16);
        assert_eq!(body["data"]["anomaly_fields"], json!(["ozone"]));
        assert!(body["data"]["anomaly_details"]["ozone"].is_string());
    }

    #[tokio::test]
    async fn malformed_upload_is_bad_request() {
        let state = state().await;
        let mut upload = serde_json::to_value(signed(unix_now(), normal_reading())).unwrap();
        upload["data"].as_object_mut().unwrap().remove("radon");
        let (status, body) = send_json(&state, post_json("/data/upload", &upload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
        assert_eq!(body["status"], 5);
    }

    #[tokio::test]
    async fn summaries_respect_window() {
        let state = state().await;
        let summaries = &state.pipeline.storage().summaries;
        for created_at in [1_000, 2_000, 3_000] {
            let record = SummaryRecord {
                id: 0,
                device_id: DEVICE.into(),
                created_at,
                sample_count: 10,
                max: normal_reading(),
                min: normal_reading(),
                avg: normal_reading(),
                var: Default::default(),
            };
            summaries.insert(&record).await.unwrap();
        }

        let uri = format!(
            "/data/summaries?device_id={}&after=1970-01-01T00:16:40Z&before=1970-01-01T00:50:00Z",
            DEVICE
        );
        let (status, body) = send_json(&state, get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], 0);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["created_at"], 2_000);

        let uri = format!("/data/summaries?device_id={}", DEVICE);
        let (_, body) = send_json(&state, get_request(&uri)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn device_view_hides_secret() {
        let state = state().await;
        let uri = format!("/devices/{}", DEVICE);
        let (status, body) = send_json(&state, get_request(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["device_id"], DEVICE);
        assert!(body["data"].get("secret").is_none());

        let (status, _) = send_json(&state, get_request("/devices/nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn analysis_without_summaries_is_no_data() {
        let state = state().await;
        let request = json!({
            "device_id": DEVICE,
            "report_type": "1",
            "start_time": "2024-01-01T00:00:00Z",
            "end_time": "2024-01-02T00:00:00Z",
        });
        let (status, body) = send_json(&state, post_json("/data/analysis", &request)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "no_data");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let state = state().await;
        let (status, body) = send_json(&state, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }
}
