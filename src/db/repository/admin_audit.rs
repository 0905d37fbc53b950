use std::str::FromStr;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;
use crate::models::AuditOutcome;

/// One admin access. Only metadata: the query is kept as length + hash prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminAuditEvent {
    pub id: i64,
    pub ts: String,
    pub endpoint: String,
    pub method: String,
    pub caller: String,
    pub table_name: Option<String>,
    pub query_len: usize,
    pub query_sha256_12: Option<String>,
    pub outcome: AuditOutcome,
    pub status_code: u16,
}

/// Fields supplied by the caller; `id` and `ts` are assigned on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAdminAuditEvent {
    pub endpoint: String,
    pub method: String,
    pub caller: String,
    pub table_name: Option<String>,
    pub query_len: usize,
    pub query_sha256_12: Option<String>,
    pub outcome: AuditOutcome,
    pub status_code: u16,
}

pub fn insert_admin_audit_event(
    conn: &Connection,
    event: &NewAdminAuditEvent,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO admin_audit_events
         (ts, endpoint, method, caller, table_name, query_len, query_sha256_12, outcome, status_code)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            chrono::Utc::now().to_rfc3339(),
            event.endpoint,
            event.method,
            event.caller,
            event.table_name,
            event.query_len as i64,
            event.query_sha256_12,
            event.outcome.as_str(),
            event.status_code,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent first.
pub fn list_admin_audit_events(
    conn: &Connection,
    limit: usize,
) -> Result<Vec<AdminAuditEvent>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, endpoint, method, caller, table_name, query_len, query_sha256_12,
         outcome, status_code
         FROM admin_audit_events ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, u16>(9)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, ts, endpoint, method, caller, table_name, query_len, sha, outcome, status)| {
                Ok(AdminAuditEvent {
                    id,
                    ts,
                    endpoint,
                    method,
                    caller,
                    table_name,
                    query_len: query_len.max(0) as usize,
                    query_sha256_12: sha,
                    outcome: AuditOutcome::from_str(&outcome)?,
                    status_code: status,
                })
            },
        )
        .collect()
}
