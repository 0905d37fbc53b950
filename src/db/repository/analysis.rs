//! Per-patient analysis refresh state and the run headers it is derived from.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::DatabaseError;
use crate::models::*;

/// Upsert the refresh state. `None` keeps the stored run id and reason;
/// `last_error` is always overwritten.
pub fn set_patient_analysis_state(
    conn: &Connection,
    patient_ref: &str,
    status: AnalysisStatus,
    last_run_id: Option<&str>,
    last_error: Option<&str>,
    changed_since_last_analysis: bool,
    refresh_reason: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patient_analysis_state
            (patient_ref, status, updated_at, last_run_id, last_error,
             changed_since_last_analysis, refresh_reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(patient_ref) DO UPDATE SET
            status = excluded.status,
            updated_at = excluded.updated_at,
            last_run_id = COALESCE(excluded.last_run_id, patient_analysis_state.last_run_id),
            last_error = excluded.last_error,
            changed_since_last_analysis = excluded.changed_since_last_analysis,
            refresh_reason = COALESCE(excluded.refresh_reason, patient_analysis_state.refresh_reason)",
        params![
            patient_ref,
            status.as_str(),
            chrono::Utc::now().to_rfc3339(),
            last_run_id,
            last_error,
            changed_since_last_analysis,
            refresh_reason,
        ],
    )?;
    Ok(())
}

pub fn get_patient_analysis_state(
    conn: &Connection,
    patient_ref: &str,
) -> Result<Option<PatientAnalysisState>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT patient_ref, status, updated_at, last_run_id, last_error,
                    changed_since_last_analysis, refresh_reason
             FROM patient_analysis_state WHERE patient_ref = ?1",
            params![patient_ref],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(patient_ref, status, updated_at, last_run_id, last_error, changed, refresh_reason)| {
            Ok(PatientAnalysisState {
                patient_ref,
                status: AnalysisStatus::from_str(&status)?,
                updated_at,
                last_run_id,
                last_error,
                changed_since_last_analysis: changed,
                refresh_reason,
            })
        },
    )
    .transpose()
}

/// Runs of one patient, newest first, optionally restricted to a trigger.
pub fn list_run_headers_for_patient(
    conn: &Connection,
    patient_ref: &str,
    trigger: Option<Trigger>,
) -> Result<Vec<RunHeader>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT run_id, created_at, status, language FROM runs
         WHERE patient_ref = ?1 AND (?2 IS NULL OR trigger = ?2)
         ORDER BY created_at DESC, run_id ASC",
    )?;
    let rows = stmt
        .query_map(params![patient_ref, trigger.map(|t| t.as_str())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(run_id, created_at, status, language)| {
            Ok(RunHeader {
                run_id,
                created_at,
                status: RunStatus::from_str(&status)?,
                language,
            })
        })
        .collect()
}

/// Patients with at least one visit, by ref.
pub fn list_patient_refs_with_visits(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT DISTINCT patient_ref FROM visits ORDER BY patient_ref ASC")?;
    let refs = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(refs)
}
