//! ==============================================================================
//! error.rs - rejection taxonomy for uploads and analysis requests
//! ==============================================================================
//!
//! every variant is terminal for the request being processed. the http layer
//! (server.rs) maps `kind()` / `code()` / `http_status()` onto the response
//! envelope; nothing inside the pipeline retries.
//!
//! ==============================================================================

use axum::http::StatusCode;

use crate::anomaly::AnomalyResult;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown device id")]
    UnknownDevice,
    #[error("request timestamp outside the accepted window")]
    ExpiredRequest,
    #[error("signature does not match")]
    InvalidSignature,
    #[error("signature already used")]
    ReplayDetected,
    #[error("reading outside acceptable range: {}", .0.anomaly_fields.join(", "))]
    AnomalousReading(AnomalyResult),
    #[error("aggregation requires at least one record")]
    EmptyBatch,
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("external service error: {0}")]
    ExternalServiceError(String),
    #[error("no data in the requested range")]
    NoData,
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IngestError {
    /// machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::UnknownDevice => "unknown_device",
            IngestError::ExpiredRequest => "expired_request",
            IngestError::InvalidSignature => "invalid_signature",
            IngestError::ReplayDetected => "replay_detected",
            IngestError::AnomalousReading(_) => "anomalous_reading",
            IngestError::EmptyBatch => "empty_batch",
            IngestError::StorageFailure(_) => "storage_failure",
            IngestError::ExternalServiceError(_) => "external_service",
            IngestError::NoData => "no_data",
            IngestError::BadRequest(_) => "bad_request",
        }
    }

    /// numeric status code carried in the response envelope
    pub fn code(&self) -> u32 {
        match self {
            IngestError::BadRequest(_) => 5,
            IngestError::UnknownDevice => 12,
            IngestError::InvalidSignature => 13,
            IngestError::ExpiredRequest => 14,
            IngestError::ReplayDetected => 15,
            IngestError::AnomalousReading(_) => 16,
            IngestError::NoData => 17,
            IngestError::ExternalServiceError(_) => 18,
            IngestError::EmptyBatch | IngestError::StorageFailure(_) => 3,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            IngestError::BadRequest(_)
            | IngestError::InvalidSignature
            | IngestError::ExpiredRequest
            | IngestError::ReplayDetected => StatusCode::BAD_REQUEST,
            IngestError::UnknownDevice | IngestError::NoData => StatusCode::NOT_FOUND,
            IngestError::AnomalousReading(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            IngestError::EmptyBatch | IngestError::StorageFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::StorageFailure(e.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_surface_as_storage_failure() {
        let err: IngestError = StoreError::NotFound("device dev-9".into()).into();
        assert_eq!(err.kind(), "storage_failure");
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn signature_errors_are_client_errors() {
        for err in [
            IngestError::ExpiredRequest,
            IngestError::InvalidSignature,
            IngestError::ReplayDetected,
        ] {
            assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(IngestError::UnknownDevice.code(), 12);
    }
}
