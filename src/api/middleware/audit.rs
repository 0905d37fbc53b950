//! Admin audit middleware.
//!
//! Outermost admin layer: every admin request, including rejected ones,
//! appends exactly one row. Only metadata is stored: the caller identity
//! (key fingerprint or `loopback`), an allowlisted table name, and the
//! length and hash prefix of the query string.

use axum::extract::Query;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::api::types::{ApiContext, Caller};
use crate::db::{insert_admin_audit_event, NewAdminAuditEvent};
use crate::models::AuditOutcome;
use crate::preview::preview_tables;
use crate::privacy::sha256_12;

#[derive(Debug, Default, Deserialize)]
struct AuditParams {
    table: Option<String>,
    query: Option<String>,
}

/// Caller string when authentication never succeeded.
const UNAUTHENTICATED: &str = "unauthenticated";

fn audit_fields(req: &Request<axum::body::Body>) -> (Option<String>, usize, Option<String>) {
    let params = Query::<AuditParams>::try_from_uri(req.uri())
        .map(|Query(p)| p)
        .unwrap_or_default();
    let table = params
        .table
        .filter(|t| preview_tables().contains(&t.as_str()));
    let query = params.query.unwrap_or_default();
    let query_len = query.chars().count();
    let query_sha = (!query.is_empty()).then(|| sha256_12(query.as_bytes()));
    (table, query_len, query_sha)
}

pub async fn record_admin_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let ctx = req.extensions().get::<ApiContext>().cloned();
    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();
    let (table_name, query_len, query_sha256_12) = audit_fields(&req);

    let response = next.run(req).await;

    let Some(ctx) = ctx else {
        return response;
    };
    let status_code = response.status().as_u16();
    let caller = response
        .extensions()
        .get::<Caller>()
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| UNAUTHENTICATED.to_string());
    let event = NewAdminAuditEvent {
        endpoint,
        method,
        caller,
        table_name,
        query_len,
        query_sha256_12,
        outcome: AuditOutcome::from_status(status_code),
        status_code,
    };

    let written = ctx
        .core
        .open_db()
        .map_err(|e| e.to_string())
        .and_then(|conn| insert_admin_audit_event(&conn, &event).map_err(|e| e.to_string()));
    if let Err(error) = written {
        tracing::error!(%error, endpoint = %event.endpoint, "Failed to append admin audit event");
    }

    response
}
