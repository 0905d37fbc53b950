use serde::{Deserialize, Serialize};

use super::enums::{AnalysisStatus, RunStatus};

/// Persisted refresh bookkeeping for one patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientAnalysisState {
    pub patient_ref: String,
    pub status: AnalysisStatus,
    pub updated_at: String,
    pub last_run_id: Option<String>,
    /// Normalized error code, never free text.
    pub last_error: Option<String>,
    pub changed_since_last_analysis: bool,
    pub refresh_reason: Option<String>,
}

/// Run row summary used to derive analysis status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHeader {
    pub run_id: String,
    pub created_at: String,
    pub status: RunStatus,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientAnalysisStatus {
    pub patient_ref: String,
    pub status: AnalysisStatus,
    pub changed_since_last_analysis: bool,
    pub latest_visit_ref: Option<String>,
    pub latest_visit_at: Option<String>,
    pub latest_run_id: Option<String>,
    pub latest_run_status: Option<RunStatus>,
    pub latest_run_at: Option<String>,
    pub last_error: Option<String>,
    pub message: &'static str,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientInbox {
    pub generated_at: String,
    pub count: usize,
    pub patients: Vec<PatientAnalysisStatus>,
}

/// Answer to a refresh request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReceipt {
    pub accepted: bool,
    pub patient_ref: String,
    /// `false` when the patient was already pending or running.
    pub queued: bool,
    pub status: AnalysisStatus,
    pub refresh_reason: String,
}
