//! Per-patient analysis refresh.
//!
//! Refresh requests coalesce per patient: a patient already pending or
//! running is not queued twice. One background worker drains the queue in
//! `patient_ref` order, running a `scheduled_refresh` pipeline run on the
//! patient's latest visit, and records the outcome in
//! `patient_analysis_state`.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;
use thiserror::Error;

use super::orchestrator::{prepare_run, spawn_run, OrchestratorError};
use crate::core_state::{CoreError, CoreState};
use crate::db::{self, DatabaseError};
use crate::models::{
    AnalysisStatus, Language, PatientAnalysisStatus, PatientInbox, RefreshReceipt, RunInput,
    RunStatus, Trigger,
};

pub const DEFAULT_REASON: &str = "manual";
const DEFAULT_INBOX_LIMIT: i64 = 50;
const MAX_INBOX_LIMIT: i64 = 200;

static REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]{1,80}$").expect("Invalid refresh reason regex"));

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Unknown patient_ref")]
    UnknownPatient,

    #[error("Patient has no visit")]
    NoVisit,

    #[error("Refresh reason must be a short lowercase identifier")]
    InvalidReason,

    #[error(transparent)]
    Run(#[from] OrchestratorError),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Refresh task ended abnormally")]
    Worker,
}

impl RefreshError {
    /// Normalized code stored as `last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownPatient | Self::Run(OrchestratorError::NotFound(_)) => "not_found",
            Self::NoVisit => "no_visit",
            Self::InvalidReason
            | Self::Run(OrchestratorError::Input(_))
            | Self::Run(OrchestratorError::Answers(_)) => "invalid_input",
            Self::Run(_) => "pipeline_error",
            Self::Database(_) | Self::Core(_) => "storage_error",
            Self::Worker => "worker_error",
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeSet<String>,
    running: BTreeSet<String>,
    last_reason: HashMap<String, String>,
    last_error: HashMap<String, String>,
    worker_active: bool,
}

/// In-memory view of queued and running refreshes.
#[derive(Debug, Default)]
pub struct RefreshQueue {
    state: Mutex<QueueState>,
}

/// Queue membership of one patient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: bool,
    pub running: bool,
    pub last_error: Option<String>,
}

impl RefreshQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the patient was newly queued and whether the caller
    /// must start the worker.
    fn enqueue(&self, patient_ref: &str, reason: &str) -> (bool, bool) {
        let mut state = self.lock();
        let tracked = state.pending.contains(patient_ref) || state.running.contains(patient_ref);
        state.pending.insert(patient_ref.to_string());
        state.last_reason.insert(patient_ref.to_string(), reason.to_string());
        state.last_error.remove(patient_ref);
        let start_worker = !state.worker_active;
        state.worker_active = true;
        (!tracked, start_worker)
    }

    /// Pop the smallest pending patient. An empty queue retires the worker
    /// under the same lock, so a concurrent enqueue starts a new one.
    fn next(&self) -> Option<(String, String)> {
        let mut state = self.lock();
        let Some(patient_ref) = state.pending.pop_first() else {
            state.worker_active = false;
            return None;
        };
        state.running.insert(patient_ref.clone());
        let reason = state
            .last_reason
            .get(&patient_ref)
            .cloned()
            .unwrap_or_else(|| "scheduled_refresh".to_string());
        Some((patient_ref, reason))
    }

    fn finish(&self, patient_ref: &str, error: Option<&str>) {
        let mut state = self.lock();
        state.running.remove(patient_ref);
        match error {
            Some(code) => state.last_error.insert(patient_ref.to_string(), code.to_string()),
            None => state.last_error.remove(patient_ref),
        };
    }

    pub fn snapshot(&self, patient_ref: &str) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            pending: state.pending.contains(patient_ref),
            running: state.running.contains(patient_ref),
            last_error: state.last_error.get(patient_ref).cloned(),
        }
    }
}

fn normalize_reason(reason: Option<&str>) -> Result<String, RefreshError> {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(DEFAULT_REASON.to_string()),
        Some(r) if REASON_RE.is_match(r) => Ok(r.to_string()),
        Some(_) => Err(RefreshError::InvalidReason),
    }
}

/// Mark the patient `refresh_pending` and make sure a worker drains the
/// queue. Must be called from within the Tokio runtime.
pub fn queue_patient_refresh(
    core: &Arc<CoreState>,
    patient_ref: &str,
    reason: Option<&str>,
) -> Result<RefreshReceipt, RefreshError> {
    let patient_ref = patient_ref.trim();
    let reason = normalize_reason(reason)?;
    {
        let conn = core.open_db()?;
        if db::get_patient(&conn, patient_ref)?.is_none() {
            return Err(RefreshError::UnknownPatient);
        }
        db::set_patient_analysis_state(
            &conn,
            patient_ref,
            AnalysisStatus::RefreshPending,
            None,
            None,
            true,
            Some(&reason),
        )?;
    }

    let (queued, start_worker) = core.refresh().enqueue(patient_ref, &reason);
    if start_worker {
        tokio::spawn(refresh_worker(Arc::clone(core)));
    }
    tracing::info!(patient_ref, reason = %reason, queued, "Patient refresh queued");

    Ok(RefreshReceipt {
        accepted: true,
        patient_ref: patient_ref.to_string(),
        queued,
        status: AnalysisStatus::RefreshPending,
        refresh_reason: reason,
    })
}

// ═══════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════

async fn refresh_worker(core: Arc<CoreState>) {
    tracing::debug!("Refresh worker started");
    while let Some((patient_ref, reason)) = core.refresh().next() {
        let outcome = refresh_patient(&core, &patient_ref, &reason).await;
        let error = record_outcome(&core, &patient_ref, &reason, outcome);
        core.refresh().finish(&patient_ref, error.as_deref());
    }
    tracing::debug!("Refresh worker idle");
}

/// Run the pipeline on the patient's latest visit. Returns the run id and
/// its terminal status.
async fn refresh_patient(
    core: &Arc<CoreState>,
    patient_ref: &str,
    reason: &str,
) -> Result<(String, RunStatus), RefreshError> {
    let input = {
        let conn = core.open_db()?;
        if db::get_patient(&conn, patient_ref)?.is_none() {
            return Err(RefreshError::UnknownPatient);
        }
        db::set_patient_analysis_state(
            &conn,
            patient_ref,
            AnalysisStatus::Running,
            None,
            None,
            true,
            Some(reason),
        )?;
        let visit = db::latest_visit(&conn, patient_ref)?.ok_or(RefreshError::NoVisit)?;
        let language = db::list_run_headers_for_patient(&conn, patient_ref, None)?
            .first()
            .and_then(|run| Language::from_str(&run.language).ok())
            .unwrap_or(Language::Fr);
        let mut input = RunInput::for_visit(patient_ref, &visit.visit_ref, language);
        input.trigger = Trigger::ScheduledRefresh;
        input
    };

    let prepared = prepare_run(core, input)?;
    let run_id = prepared.run.run_id.clone();
    let status = spawn_run(Arc::clone(core), prepared)
        .await
        .map_err(|_| RefreshError::Worker)?;
    Ok((run_id, status))
}

/// Persist the refresh outcome; returns the error code, if any.
fn record_outcome(
    core: &CoreState,
    patient_ref: &str,
    reason: &str,
    outcome: Result<(String, RunStatus), RefreshError>,
) -> Option<String> {
    let (status, run_id, error, changed) = match &outcome {
        Ok((run_id, status)) if is_analyzed(*status) => {
            (AnalysisStatus::UpToDate, Some(run_id.as_str()), None, false)
        }
        Ok((run_id, status)) => (
            AnalysisStatus::Failed,
            Some(run_id.as_str()),
            Some(format!("pipeline_status={status}")),
            true,
        ),
        Err(e) => (AnalysisStatus::Failed, None, Some(e.code().to_string()), true),
    };

    match &outcome {
        Ok((run_id, run_status)) => tracing::info!(
            patient_ref,
            run_id = %run_id,
            run_status = %run_status,
            "Patient refresh finished"
        ),
        Err(e) => tracing::warn!(patient_ref, code = e.code(), error = %e, "Patient refresh failed"),
    }

    let stored = core.open_db().map_err(RefreshError::from).and_then(|conn| {
        db::set_patient_analysis_state(
            &conn,
            patient_ref,
            status,
            run_id,
            error.as_deref(),
            changed,
            Some(reason),
        )
        .map_err(RefreshError::from)
    });
    if let Err(e) = stored {
        tracing::error!(patient_ref, error = %e, "Failed to record refresh outcome");
    }
    error
}

/// Terminal run statuses that count as an analysis of the latest visit.
fn is_analyzed(status: RunStatus) -> bool {
    matches!(status, RunStatus::Completed | RunStatus::NeedsMoreInfo)
}

// ═══════════════════════════════════════════════════════════
// Status & inbox
// ═══════════════════════════════════════════════════════════

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn analysis_status(
    conn: &Connection,
    queue: &RefreshQueue,
    patient_ref: &str,
) -> Result<PatientAnalysisStatus, RefreshError> {
    let latest_visit = db::latest_visit(conn, patient_ref)?;
    let refresh_runs =
        db::list_run_headers_for_patient(conn, patient_ref, Some(Trigger::ScheduledRefresh))?;
    let latest_run = refresh_runs.first();
    let latest_analyzed = refresh_runs.iter().find(|r| is_analyzed(r.status));
    let state = db::get_patient_analysis_state(conn, patient_ref)?;
    let queued = queue.snapshot(patient_ref);

    let changed = match (&latest_visit, latest_analyzed) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(visit), Some(run)) => match (parse_ts(&visit.occurred_at), parse_ts(&run.created_at)) {
            (Some(visit_at), Some(run_at)) => visit_at > run_at,
            _ => false,
        },
    };

    let state_failed = state.as_ref().is_some_and(|s| s.status == AnalysisStatus::Failed);
    let status = if queued.running {
        AnalysisStatus::Running
    } else if queued.pending {
        AnalysisStatus::RefreshPending
    } else if latest_run.is_some_and(|r| r.status == RunStatus::Failed)
        || queued.last_error.is_some()
    {
        AnalysisStatus::Failed
    } else if changed {
        AnalysisStatus::RefreshPending
    } else if latest_analyzed.is_some() {
        AnalysisStatus::UpToDate
    } else if state_failed {
        AnalysisStatus::Failed
    } else {
        AnalysisStatus::UpToDate
    };

    let (state_error, updated_at) = match state {
        Some(s) => (s.last_error, s.updated_at),
        None => (None, Utc::now().to_rfc3339()),
    };

    Ok(PatientAnalysisStatus {
        patient_ref: patient_ref.to_string(),
        status,
        changed_since_last_analysis: changed,
        latest_visit_ref: latest_visit.as_ref().map(|v| v.visit_ref.clone()),
        latest_visit_at: latest_visit.map(|v| v.occurred_at),
        latest_run_id: latest_run.map(|r| r.run_id.clone()),
        latest_run_status: latest_run.map(|r| r.status),
        latest_run_at: latest_run.map(|r| r.created_at.clone()),
        last_error: queued.last_error.or(state_error),
        message: status.message(),
        updated_at,
    })
}

pub fn patient_analysis_status(
    core: &CoreState,
    patient_ref: &str,
) -> Result<PatientAnalysisStatus, RefreshError> {
    let conn = core.open_db()?;
    if db::get_patient(&conn, patient_ref)?.is_none() {
        return Err(RefreshError::UnknownPatient);
    }
    analysis_status(&conn, core.refresh(), patient_ref)
}

/// Patients needing attention, most recent visit first.
pub fn patients_inbox(core: &CoreState, limit: Option<i64>) -> Result<PatientInbox, RefreshError> {
    let limit = limit.unwrap_or(DEFAULT_INBOX_LIMIT).clamp(1, MAX_INBOX_LIMIT) as usize;
    let conn = core.open_db()?;
    let mut patients = Vec::new();
    for patient_ref in db::list_patient_refs_with_visits(&conn)? {
        let status = analysis_status(&conn, core.refresh(), &patient_ref)?;
        if status.changed_since_last_analysis || status.status.is_actionable() {
            patients.push(status);
        }
    }
    patients.sort_by_cached_key(|p| {
        std::cmp::Reverse(p.latest_visit_at.as_deref().and_then(parse_ts))
    });
    patients.truncate(limit);

    Ok(PatientInbox {
        generated_at: Utc::now().to_rfc3339(),
        count: patients.len(),
        patients,
    })
}
