//! Redacted, read-only table preview for the admin surface.
//!
//! Every table has a compiled-in projection: structured columns plus
//! counts derived from stored JSON. Free-text fields (intake text, report
//! markdown, event payloads, document metadata) are never selected. The
//! table name is checked against the allowlist before a connection is
//! touched, and the query string is only ever bound as a LIKE parameter.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::{like_prefix, DatabaseError};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;
pub const MAX_QUERY_CHARS: usize = 64;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Unsupported table")]
    UnknownTable,

    #[error("Query is too long")]
    QueryTooLong,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for PreviewError {
    fn from(err: rusqlite::Error) -> Self {
        PreviewError::Database(err.into())
    }
}

/// Compiled-in projection of one previewable table.
struct TableSpec {
    name: &'static str,
    search_column: &'static str,
    /// `(output column, SQL expression)` in output order.
    projection: &'static [(&'static str, &'static str)],
    order_by: &'static str,
}

static TABLES: &[TableSpec] = &[
    TableSpec {
        name: "runs",
        search_column: "run_id",
        projection: &[
            ("run_id", "run_id"),
            ("created_at", "created_at"),
            ("status", "status"),
            ("language", "language"),
            ("case_ref", "case_ref"),
            ("patient_ref", "patient_ref"),
            ("visit_ref", "visit_ref"),
            (
                "follow_up_questions_count",
                "COALESCE(json_array_length(artifacts_json, '$.recommendation.follow_up_questions'), 0)",
            ),
            ("has_report", "IFNULL(json_type(artifacts_json, '$.report_markdown'), '') = 'text'"),
            ("has_handout", "IFNULL(json_type(artifacts_json, '$.handout_markdown'), '') = 'text'"),
            ("has_trace", "IFNULL(json_type(artifacts_json, '$.trace'), '') = 'object'"),
            (
                "policy_violations_count",
                "COALESCE(json_array_length(policy_violations_json), 0)",
            ),
        ],
        order_by: "created_at DESC, run_id DESC",
    },
    TableSpec {
        name: "run_events",
        search_column: "run_id",
        projection: &[
            ("id", "id"),
            ("run_id", "run_id"),
            ("ts", "ts"),
            ("type", "type"),
            ("step", "step"),
            ("tool_name", "json_extract(data_json, '$.tool_name')"),
            ("rule_id", "json_extract(data_json, '$.rule_id')"),
            ("severity", "json_extract(data_json, '$.severity')"),
        ],
        order_by: "id DESC",
    },
    TableSpec {
        name: "patients",
        search_column: "patient_ref",
        projection: &[
            ("patient_ref", "patient_ref"),
            ("age_years", "json_extract(llm_context_json, '$.demographics.age_years')"),
            ("sex", "json_extract(llm_context_json, '$.demographics.sex')"),
            (
                "allergies_count",
                "COALESCE(json_array_length(llm_context_json, '$.allergies'), 0)",
            ),
            (
                "conditions_count",
                "COALESCE(json_array_length(llm_context_json, '$.conditions'), 0)",
            ),
            (
                "current_medications_count",
                "COALESCE(json_array_length(llm_context_json, '$.current_medications'), 0)",
            ),
        ],
        order_by: "patient_ref ASC",
    },
    TableSpec {
        name: "visits",
        search_column: "visit_ref",
        projection: &[
            ("visit_ref", "visit_ref"),
            ("patient_ref", "patient_ref"),
            ("occurred_at", "occurred_at"),
            ("primary_domain", "primary_domain"),
            ("source", "source"),
            (
                "symptoms_count",
                "COALESCE(json_array_length(intake_extracted_json, '$.symptoms'), 0)",
            ),
            (
                "red_flags_count",
                "COALESCE(json_array_length(intake_extracted_json, '$.red_flags'), 0)",
            ),
        ],
        order_by: "occurred_at DESC, visit_ref DESC",
    },
    TableSpec {
        name: "events",
        search_column: "event_ref",
        projection: &[
            ("event_ref", "event_ref"),
            ("patient_ref", "patient_ref"),
            ("visit_ref", "visit_ref"),
            ("occurred_at", "occurred_at"),
            ("kind", "kind"),
        ],
        order_by: "occurred_at DESC, event_ref DESC",
    },
    TableSpec {
        name: "inventory",
        search_column: "sku",
        projection: &[
            ("sku", "sku"),
            ("name", "json_extract(product_json, '$.name')"),
            ("category", "category"),
            ("in_stock", "in_stock"),
            ("stock_qty", "stock_qty"),
            ("price_eur", "price_eur"),
        ],
        order_by: "sku ASC",
    },
    TableSpec {
        name: "documents",
        search_column: "doc_ref",
        projection: &[
            ("doc_ref", "doc_ref"),
            ("patient_ref", "patient_ref"),
            ("status", "status"),
            ("page_count", "page_count"),
            ("sha256_12", "sha256_12"),
            ("created_at", "created_at"),
        ],
        order_by: "created_at DESC, doc_ref DESC",
    },
    TableSpec {
        name: "patient_analysis_state",
        search_column: "patient_ref",
        projection: &[
            ("patient_ref", "patient_ref"),
            ("status", "status"),
            ("updated_at", "updated_at"),
            ("last_run_id", "last_run_id"),
            ("changed_since_last_analysis", "changed_since_last_analysis"),
            ("refresh_reason", "refresh_reason"),
        ],
        order_by: "updated_at DESC, patient_ref ASC",
    },
];

/// Previewable table names, in display order.
pub fn preview_tables() -> Vec<&'static str> {
    TABLES.iter().map(|t| t.name).collect()
}

fn is_table_shaped(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
}

/// Exact allowlist lookup. Anything else, including names with trailing
/// SQL, fails closed.
fn lookup(table: &str) -> Result<&'static TableSpec, PreviewError> {
    if !is_table_shaped(table) {
        return Err(PreviewError::UnknownTable);
    }
    TABLES
        .iter()
        .find(|t| t.name == table)
        .ok_or(PreviewError::UnknownTable)
}

/// `None` → default, otherwise clamped to `1..=MAX_LIMIT`.
pub fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        None => DEFAULT_LIMIT,
        Some(n) => n.clamp(1, MAX_LIMIT as i64) as usize,
    }
}

/// Validated preview parameters; no connection has been touched yet.
#[derive(Debug, Clone)]
pub struct PreviewRequest {
    table: &'static TableSpec,
    query: String,
    limit: usize,
}

impl std::fmt::Debug for TableSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PreviewRequest {
    pub fn parse(table: &str, query: Option<&str>, limit: Option<i64>) -> Result<Self, PreviewError> {
        let table = lookup(table)?;
        let query = query.unwrap_or("").trim();
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(PreviewError::QueryTooLong);
        }
        Ok(Self {
            table,
            query: query.to_string(),
            limit: clamp_limit(limit),
        })
    }

    pub fn table(&self) -> &'static str {
        self.table.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewResponse {
    pub table: &'static str,
    pub query: String,
    pub limit: usize,
    /// Rows matching the query, before the limit.
    pub count: usize,
    pub redacted: bool,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Map<String, Value>>,
}

fn json_cell(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        // No projection selects blobs.
        ValueRef::Blob(_) => Value::Null,
    }
}

/// Run a validated preview.
pub fn preview(conn: &Connection, request: &PreviewRequest) -> Result<PreviewResponse, PreviewError> {
    let spec = request.table;
    let pattern = like_prefix(&request.query);
    let filter = format!("WHERE {} LIKE ?1 ESCAPE '\\'", spec.search_column);

    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} {filter}", spec.name),
        params![pattern],
        |row| row.get(0),
    )?;

    let select = spec
        .projection
        .iter()
        .map(|(_, expr)| *expr)
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {select} FROM {} {filter} ORDER BY {} LIMIT ?2",
        spec.name, spec.order_by
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![pattern, request.limit as i64], |row| {
            let mut out = Map::new();
            for (idx, (column, _)) in spec.projection.iter().enumerate() {
                out.insert((*column).to_string(), json_cell(row.get_ref(idx)?));
            }
            Ok(out)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(table = spec.name, rows = rows.len(), "Preview served");

    Ok(PreviewResponse {
        table: spec.name,
        query: request.query.clone(),
        limit: request.limit,
        count: count.max(0) as usize,
        redacted: true,
        columns: spec.projection.iter().map(|(c, _)| *c).collect(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_run, open_memory_database, seed_demo_dataset};
    use crate::models::{Language, Run, RunInput};

    fn seeded() -> Connection {
        let conn = open_memory_database().unwrap();
        seed_demo_dataset(&conn).unwrap();
        conn
    }

    #[test]
    fn rejects_unknown_and_injected_table_names() {
        for table in [
            "",
            "sqlite_master",
            "patients;drop table runs",
            "patients --",
            "Patients",
            "admin_audit_events",
        ] {
            assert!(
                matches!(PreviewRequest::parse(table, None, None), Err(PreviewError::UnknownTable)),
                "{table:?} should be rejected"
            );
        }
    }

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(clamp_limit(None), 20);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(1000)), 100);
        assert_eq!(clamp_limit(Some(42)), 42);
    }

    #[test]
    fn long_query_is_a_validation_error() {
        let query = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(matches!(
            PreviewRequest::parse("patients", Some(&query), None),
            Err(PreviewError::QueryTooLong)
        ));
        assert!(PreviewRequest::parse("patients", Some(&"x".repeat(MAX_QUERY_CHARS)), None).is_ok());
    }

    #[test]
    fn patients_projection_has_counts_only() {
        let conn = seeded();
        let req = PreviewRequest::parse("patients", Some("pt_00000"), Some(2)).unwrap();
        let out = preview(&conn, &req).unwrap();

        assert!(out.redacted);
        assert_eq!(out.limit, 2);
        assert_eq!(out.rows.len(), 2);
        assert!(out.count >= 2);
        assert_eq!(
            out.columns,
            vec![
                "patient_ref",
                "age_years",
                "sex",
                "allergies_count",
                "conditions_count",
                "current_medications_count"
            ]
        );
        assert_eq!(out.rows[0]["patient_ref"], "pt_000000");
        assert!(out.rows[0]["allergies_count"].is_i64());
        assert!(!out.rows[0].contains_key("llm_context_json"));
    }

    #[test]
    fn wildcards_in_query_are_literal() {
        let conn = seeded();
        let req = PreviewRequest::parse("patients", Some("%"), None).unwrap();
        assert_eq!(preview(&conn, &req).unwrap().count, 0);

        let req = PreviewRequest::parse("patients", Some("pt\\_"), None).unwrap();
        assert_eq!(preview(&conn, &req).unwrap().count, 0);
    }

    #[test]
    fn runs_projection_reports_artifact_presence() {
        let conn = seeded();
        let run = Run::new(RunInput::for_case("case_000042", Language::En));
        insert_run(&conn, &run).unwrap();

        let req = PreviewRequest::parse("runs", Some(&run.run_id), None).unwrap();
        let out = preview(&conn, &req).unwrap();
        assert_eq!(out.count, 1);
        let row = &out.rows[0];
        assert_eq!(row["status"], "created");
        assert_eq!(row["case_ref"], "case_000042");
        assert_eq!(row["has_report"], 0);
        assert_eq!(row["follow_up_questions_count"], 0);
        assert_eq!(row["policy_violations_count"], 0);
        assert!(!row.contains_key("input_json"));
    }

    #[test]
    fn analysis_state_projection_omits_error_text() {
        let conn = seeded();
        crate::db::set_patient_analysis_state(
            &conn,
            "pt_000001",
            crate::models::AnalysisStatus::Failed,
            Some("run-1"),
            Some("storage_error"),
            true,
            Some("ocr_upload"),
        )
        .unwrap();
        let req = PreviewRequest::parse("patient_analysis_state", Some("pt_0"), None).unwrap();
        let out = preview(&conn, &req).unwrap();
        assert_eq!(out.count, 1);
        let row = &out.rows[0];
        assert_eq!(row["status"], "failed");
        assert_eq!(row["changed_since_last_analysis"], 1);
        assert!(!row.contains_key("last_error"));
    }

    #[test]
    fn every_allowlisted_table_previews() {
        let conn = seeded();
        for table in preview_tables() {
            let req = PreviewRequest::parse(table, None, None).unwrap();
            let out = preview(&conn, &req).unwrap();
            assert_eq!(out.table, table);
            assert!(out.rows.len() <= DEFAULT_LIMIT);
        }
    }
}
