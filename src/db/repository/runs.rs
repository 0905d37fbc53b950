use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::db::DatabaseError;
use crate::models::*;

pub fn insert_run(conn: &Connection, run: &Run) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO runs (run_id, created_at, updated_at, status, language, trigger,
         case_ref, patient_ref, visit_ref, input_json, artifacts_json, policy_violations_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            run.run_id,
            run.created_at,
            run.updated_at,
            run.status.as_str(),
            run.input.language.as_str(),
            run.input.trigger.as_str(),
            run.input.case_ref,
            run.input.patient_ref,
            run.input.visit_ref,
            serde_json::to_string(&run.input)?,
            serde_json::to_string(&run.artifacts)?,
            serde_json::to_string(&run.policy_violations)?,
        ],
    )?;
    Ok(())
}

/// Move a non-terminal run to `status`. Terminal rows are never touched.
pub fn update_run_status(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE runs SET status = ?2, updated_at = ?3
         WHERE run_id = ?1 AND status IN ('created', 'running')",
        params![run_id, status.as_str(), chrono::Utc::now().to_rfc3339()],
    )?;
    if changed == 0 {
        return Err(terminal_or_missing(conn, run_id)?);
    }
    Ok(())
}

/// Persist the final state of a run in one write.
pub fn finish_run(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    artifacts: &Artifacts,
    policy_violations: &[Violation],
) -> Result<(), DatabaseError> {
    if !status.is_terminal() {
        return Err(DatabaseError::ConstraintViolation(format!(
            "finish_run requires a terminal status, got {status}"
        )));
    }
    let changed = conn.execute(
        "UPDATE runs SET status = ?2, updated_at = ?3, artifacts_json = ?4, policy_violations_json = ?5
         WHERE run_id = ?1 AND status IN ('created', 'running')",
        params![
            run_id,
            status.as_str(),
            chrono::Utc::now().to_rfc3339(),
            serde_json::to_string(artifacts)?,
            serde_json::to_string(policy_violations)?,
        ],
    )?;
    if changed == 0 {
        return Err(terminal_or_missing(conn, run_id)?);
    }
    Ok(())
}

fn terminal_or_missing(conn: &Connection, run_id: &str) -> Result<DatabaseError, DatabaseError> {
    Ok(match get_run(conn, run_id)? {
        Some(run) => DatabaseError::ConstraintViolation(format!(
            "run {run_id} is already {}",
            run.status
        )),
        None => DatabaseError::NotFound {
            entity_type: "Run".into(),
            id: run_id.into(),
        },
    })
}

pub fn get_run(conn: &Connection, run_id: &str) -> Result<Option<Run>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT run_id, created_at, updated_at, status, input_json, artifacts_json,
         policy_violations_json
         FROM runs WHERE run_id = ?1",
    )?;

    let result = stmt.query_row(params![run_id], |row| {
        Ok(RunRow {
            run_id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            status: row.get(3)?,
            input_json: row.get(4)?,
            artifacts_json: row.get(5)?,
            policy_violations_json: row.get(6)?,
        })
    });

    match result {
        Ok(row) => Ok(Some(run_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct RunRow {
    run_id: String,
    created_at: String,
    updated_at: String,
    status: String,
    input_json: String,
    artifacts_json: String,
    policy_violations_json: String,
}

fn run_from_row(row: RunRow) -> Result<Run, DatabaseError> {
    Ok(Run {
        run_id: row.run_id,
        created_at: row.created_at,
        updated_at: row.updated_at,
        status: RunStatus::from_str(&row.status)?,
        input: serde_json::from_str(&row.input_json)?,
        artifacts: serde_json::from_str(&row.artifacts_json)?,
        policy_violations: serde_json::from_str(&row.policy_violations_json)?,
    })
}
