//! API error types with structured JSON responses.
//!
//! Every variant maps to a stable code. Messages are fixed or built from
//! codes and identifiers only; internal details are logged, never returned.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cases::CaseError;
use crate::core_state::CoreError;
use crate::db::DatabaseError;
use crate::ingest::IngestError;
use crate::pipeline::orchestrator::OrchestratorError;
use crate::pipeline::refresh::RefreshError;
use crate::preview::PreviewError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_ref: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unsupported media type")]
    UnsupportedMediaType,
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Malformed document: {0}")]
    MalformedDocument(String),
    #[error("Document rejected at the PHI boundary")]
    PhiRejected { doc_ref: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MalformedDocument(_) | ApiError::PhiRejected { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "AUTH_REQUIRED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "VALIDATION_FAILED",
            ApiError::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            ApiError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiError::MalformedDocument(_) => "MALFORMED_DOCUMENT",
            ApiError::PhiRejected { .. } => "PHI_BOUNDARY",
            ApiError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Unauthorized => "Authentication required".to_string(),
            ApiError::RateLimited { retry_after } => {
                format!("Rate limit exceeded. Retry after {retry_after}s")
            }
            ApiError::NotFound(detail)
            | ApiError::BadRequest(detail)
            | ApiError::MalformedDocument(detail) => detail.clone(),
            ApiError::UnsupportedMediaType => "Only application/pdf is accepted".to_string(),
            ApiError::PayloadTooLarge => "Upload exceeds the configured size limit".to_string(),
            ApiError::PhiRejected { .. } => "PHI detected after redaction".to_string(),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                "An internal error occurred".to_string()
            }
        };
        let doc_ref = match &self {
            ApiError::PhiRejected { doc_ref } => Some(doc_ref.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
                doc_ref,
            },
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            if let Ok(val) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Input(e) => ApiError::BadRequest(e.to_string()),
            OrchestratorError::Answers(e) => ApiError::BadRequest(e.to_string()),
            OrchestratorError::RunNotTerminal(_) => {
                ApiError::BadRequest("Prior run has not finished yet".into())
            }
            OrchestratorError::NotFound(what) => ApiError::NotFound(format!("Unknown {what}")),
            OrchestratorError::Case(CaseError::NotFound(_)) => {
                ApiError::NotFound("Unknown case_ref".into())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::UnknownPatient => ApiError::NotFound("Unknown patient_ref".into()),
            RefreshError::InvalidReason => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedMediaType => ApiError::UnsupportedMediaType,
            IngestError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge,
            IngestError::MalformedDocument(msg) => ApiError::MalformedDocument(msg.to_string()),
            IngestError::PhiRejected { doc_ref, .. } => ApiError::PhiRejected { doc_ref },
            IngestError::UnknownPatient => ApiError::NotFound("Unknown patient_ref".into()),
            IngestError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PreviewError> for ApiError {
    fn from(err: PreviewError) -> Self {
        match err {
            PreviewError::UnknownTable => ApiError::BadRequest("Unsupported table".into()),
            PreviewError::QueryTooLong => ApiError::BadRequest("Query is too long".into()),
            PreviewError::Database(e) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_returns_401() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn rate_limited_returns_429_with_retry_after() {
        let response = ApiError::RateLimited { retry_after: 60 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn internal_hides_detail() {
        let response = ApiError::Internal("disk I/O error at /secret/path".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn phi_rejection_carries_doc_ref() {
        let response = ApiError::PhiRejected {
            doc_ref: "doc_0123456789ab".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "PHI_BOUNDARY");
        assert_eq!(json["error"]["doc_ref"], "doc_0123456789ab");
    }

    #[test]
    fn status_table() {
        let cases = [
            (ApiError::NotFound("x".into()), 404, "NOT_FOUND"),
            (ApiError::BadRequest("x".into()), 400, "VALIDATION_FAILED"),
            (ApiError::UnsupportedMediaType, 415, "UNSUPPORTED_MEDIA_TYPE"),
            (ApiError::PayloadTooLarge, 413, "PAYLOAD_TOO_LARGE"),
            (ApiError::MalformedDocument("x".into()), 422, "MALFORMED_DOCUMENT"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn orchestrator_errors_map_to_client_codes() {
        let err: ApiError = OrchestratorError::NotFound("visit_ref").into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err: ApiError = OrchestratorError::RunNotTerminal("run_x".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
