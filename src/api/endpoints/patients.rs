//! Redacted patient and visit listings.
//!
//! Responses carry identifiers, demographics buckets and counts only;
//! no free-text field leaves the database through these routes.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::parse_limit;
use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::db::{self, PatientSummary, VisitSummary};
use crate::models::{PatientAnalysisStatus, PatientInbox, RefreshReceipt};
use crate::pipeline::refresh::{patient_analysis_status, patients_inbox, queue_patient_refresh};
use crate::preview::{clamp_limit, MAX_QUERY_CHARS};

#[derive(Debug, Default, Deserialize)]
pub struct PatientSearchQuery {
    pub query: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InboxQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct PatientsResponse {
    pub patients: Vec<PatientSummary>,
}

#[derive(Serialize)]
pub struct VisitsResponse {
    pub patient_ref: String,
    pub visits: Vec<VisitSummary>,
}

/// `GET /patients?query=&limit=` — prefix search on `patient_ref`.
pub async fn search(
    State(ctx): State<ApiContext>,
    Query(params): Query<PatientSearchQuery>,
) -> Result<Json<PatientsResponse>, ApiError> {
    let query = params.query.as_deref().map(str::trim).unwrap_or("");
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(ApiError::BadRequest("Query is too long".into()));
    }
    let limit = clamp_limit(parse_limit(params.limit.as_deref())?);

    let conn = ctx.core.open_db()?;
    let patients = db::search_patients(&conn, Some(query), limit)?;
    Ok(Json(PatientsResponse { patients }))
}

/// `GET /patients/:patient_ref/visits`
pub async fn visits(
    State(ctx): State<ApiContext>,
    Path(patient_ref): Path<String>,
) -> Result<Json<VisitsResponse>, ApiError> {
    let conn = ctx.core.open_db()?;
    if db::get_patient(&conn, &patient_ref)?.is_none() {
        return Err(ApiError::NotFound("Unknown patient_ref".into()));
    }
    let visits = db::list_visits(&conn, &patient_ref)?
        .iter()
        .map(VisitSummary::from)
        .collect();
    Ok(Json(VisitsResponse {
        patient_ref,
        visits,
    }))
}

/// `GET /patients/inbox?limit=` — patients whose analysis needs attention.
pub async fn inbox(
    State(ctx): State<ApiContext>,
    Query(params): Query<InboxQuery>,
) -> Result<Json<PatientInbox>, ApiError> {
    let limit = parse_limit(params.limit.as_deref())?;
    Ok(Json(patients_inbox(&ctx.core, limit)?))
}

/// `GET /patients/:patient_ref/analysis-status`
pub async fn analysis_status(
    State(ctx): State<ApiContext>,
    Path(patient_ref): Path<String>,
) -> Result<Json<PatientAnalysisStatus>, ApiError> {
    Ok(Json(patient_analysis_status(&ctx.core, &patient_ref)?))
}

/// `POST /patients/:patient_ref/refresh` — `202`; the body is optional.
pub async fn refresh(
    State(ctx): State<ApiContext>,
    Path(patient_ref): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<RefreshReceipt>), ApiError> {
    let request: RefreshRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("Request body is not valid JSON for this endpoint".into()))?
    };
    let receipt = queue_patient_refresh(&ctx.core, &patient_ref, request.reason.as_deref())?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
