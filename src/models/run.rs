use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::briefing::{PlannerPlan, Prebrief};
use super::enums::{Language, RunStatus, StepMode, Trigger};
use super::intake::{EvidenceItem, IntakeExtracted, Recommendation};
use super::trace::{TraceArtifact, Violation};

/// Fixture ids: strict so a reference can never become a path fragment.
static CASE_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^case_[a-z0-9_]{6,32}$").expect("Invalid case_ref regex"));

static DATASET_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{2,63}$").expect("Invalid dataset ref regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpAnswer {
    pub question_id: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_ref: Option<String>,
    pub language: Language,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up_answers: Vec<FollowUpAnswer>,
}

/// What a run input resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReference {
    Case(String),
    Visit {
        patient_ref: Option<String>,
        visit_ref: String,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("Exactly one of case_ref or visit_ref is required")]
    AmbiguousReference,
    #[error("patient_ref is only accepted together with visit_ref")]
    PatientWithoutVisit,
    #[error("Malformed {0}")]
    MalformedReference(&'static str),
}

impl RunInput {
    pub fn for_case(case_ref: &str, language: Language) -> Self {
        Self {
            case_ref: Some(case_ref.to_string()),
            patient_ref: None,
            visit_ref: None,
            language,
            trigger: Trigger::Manual,
            follow_up_answers: Vec::new(),
        }
    }

    pub fn for_visit(patient_ref: &str, visit_ref: &str, language: Language) -> Self {
        Self {
            case_ref: None,
            patient_ref: Some(patient_ref.to_string()),
            visit_ref: Some(visit_ref.to_string()),
            language,
            trigger: Trigger::Manual,
            follow_up_answers: Vec::new(),
        }
    }

    /// Validate the reference shape: case XOR (optional patient + visit).
    pub fn reference(&self) -> Result<RunReference, InputError> {
        let case_ref = self.case_ref.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let visit_ref = self.visit_ref.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let patient_ref = self
            .patient_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match (case_ref, visit_ref) {
            (Some(case_ref), None) => {
                if patient_ref.is_some() {
                    return Err(InputError::PatientWithoutVisit);
                }
                if !CASE_REF_RE.is_match(case_ref) {
                    return Err(InputError::MalformedReference("case_ref"));
                }
                Ok(RunReference::Case(case_ref.to_string()))
            }
            (None, Some(visit_ref)) => {
                if !DATASET_REF_RE.is_match(visit_ref) {
                    return Err(InputError::MalformedReference("visit_ref"));
                }
                if let Some(p) = patient_ref {
                    if !DATASET_REF_RE.is_match(p) {
                        return Err(InputError::MalformedReference("patient_ref"));
                    }
                }
                Ok(RunReference::Visit {
                    patient_ref: patient_ref.map(String::from),
                    visit_ref: visit_ref.to_string(),
                })
            }
            (None, None) if patient_ref.is_some() => Err(InputError::PatientWithoutVisit),
            _ => Err(InputError::AmbiguousReference),
        }
    }
}

/// How one step produced its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepModeRecord {
    pub mode: StepMode,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_extracted: Option<IntakeExtracted>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_items: Option<Vec<EvidenceItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handout_markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prebrief: Option<Prebrief>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlannerPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceArtifact>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub step_modes: BTreeMap<String, StepModeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    pub input: RunInput,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    pub policy_violations: Vec<Violation>,
}

impl Run {
    pub fn new(input: RunInput) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            created_at: now.clone(),
            updated_at: now,
            status: RunStatus::Created,
            input,
            artifacts: Artifacts::default(),
            policy_violations: Vec::new(),
        }
    }
}
