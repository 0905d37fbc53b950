//! Admin endpoints: redacted storage preview and the admin audit log.
//!
//! All three routes sit behind the admin key, the rate limiter and the
//! audit layer.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::parse_limit;
use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::db::{list_admin_audit_events, AdminAuditEvent};
use crate::preview::{self, clamp_limit, preview_tables, PreviewRequest, PreviewResponse};

#[derive(Serialize)]
pub struct TablesResponse {
    pub tables: Vec<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PreviewParams {
    pub table: Option<String>,
    pub query: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditListParams {
    pub limit: Option<String>,
}

#[derive(Serialize)]
pub struct AuditEventsResponse {
    pub events: Vec<AdminAuditEvent>,
}

/// `GET /admin/db-preview/tables`
pub async fn tables() -> Json<TablesResponse> {
    Json(TablesResponse {
        tables: preview_tables(),
    })
}

/// `GET /admin/db-preview?table=&query=&limit=`
///
/// The table is validated against the allowlist before a connection is
/// opened.
pub async fn db_preview(
    State(ctx): State<ApiContext>,
    Query(params): Query<PreviewParams>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let limit = parse_limit(params.limit.as_deref())?;
    let request = PreviewRequest::parse(
        params.table.as_deref().unwrap_or(""),
        params.query.as_deref(),
        limit,
    )?;
    let conn = ctx.core.open_db()?;
    let response = preview::preview(&conn, &request)?;
    tracing::info!(table = request.table(), rows = response.rows.len(), "Admin preview served");
    Ok(Json(response))
}

/// `GET /admin/audit-events?limit=` — newest first.
pub async fn audit_events(
    State(ctx): State<ApiContext>,
    Query(params): Query<AuditListParams>,
) -> Result<Json<AuditEventsResponse>, ApiError> {
    let limit = clamp_limit(parse_limit(params.limit.as_deref())?);
    let conn = ctx.core.open_db()?;
    let events = list_admin_audit_events(&conn, limit)?;
    Ok(Json(AuditEventsResponse { events }))
}
