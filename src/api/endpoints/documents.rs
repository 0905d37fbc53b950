//! Prescription PDF upload.
//!
//! `POST /documents/prescription?patient_ref=&language=` with the raw PDF
//! as the request body. The body is read up to the configured cap before
//! anything is parsed; only metadata is stored or returned. A successful
//! upload queues an analysis refresh for the patient.

use std::str::FromStr;

use axum::body::{to_bytes, Body};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::ingest::prescription::is_pdf_media_type;
use crate::ingest::{ingest_prescription_pdf, IngestReceipt, PrescriptionUpload};
use crate::models::Language;
use crate::pipeline::refresh::queue_patient_refresh;

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub patient_ref: Option<String>,
    pub language: Option<String>,
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// `POST /documents/prescription` — `201` with an ingestion receipt.
pub async fn upload_prescription(
    State(ctx): State<ApiContext>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<IngestReceipt>), ApiError> {
    let patient_ref = params
        .patient_ref
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("patient_ref is required".into()))?;
    let language = match params.language.as_deref().map(str::trim) {
        None | Some("") => Language::Fr,
        Some(raw) => Language::from_str(raw)
            .map_err(|_| ApiError::BadRequest("language must be fr or en".into()))?,
    };

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    if !is_pdf_media_type(content_type.as_deref()) {
        return Err(ApiError::UnsupportedMediaType);
    }

    let limits = ctx.core.config().uploads;
    if content_length(&headers).is_some_and(|len| len > limits.max_bytes) {
        return Err(ApiError::PayloadTooLarge);
    }
    let bytes = to_bytes(body, limits.max_bytes)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let upload = PrescriptionUpload {
        patient_ref,
        language,
        content_type,
        bytes: bytes.to_vec(),
    };
    let receipt = ingest_prescription_pdf(
        &ctx.core.config().db_path,
        ctx.core.pdf(),
        &limits,
        upload,
    )
    .await?;

    // The upload stands even if the refresh cannot be queued.
    if let Err(e) = queue_patient_refresh(&ctx.core, &receipt.patient_ref, Some("ocr_upload")) {
        tracing::warn!(doc_ref = %receipt.doc_ref, code = e.code(), "Refresh not queued after upload");
    }
    Ok((StatusCode::CREATED, Json(receipt)))
}
