//! Pipeline steps and their static registry.
//!
//! Each step is a unit struct implementing `PipelineStep`. Steps only read
//! the partial `ArtifactBag` built by earlier steps and return a new
//! `StepOutput`; the orchestrator owns the bag and applies outputs in order.

pub mod evidence;
pub mod handout;
pub mod intake;
pub mod phi_scrub;
pub mod planner;
pub mod prebrief;
pub mod ranker;
pub mod report;
pub mod safety;
pub mod trace_assembly;
pub mod triage;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use super::follow_up::AnswerMap;
use super::model_client::ModelError;
use super::trace::TraceHub;
use crate::db::DatabaseError;
use crate::models::{
    Artifacts, EventType, EvidenceItem, IntakeExtracted, Language, PatientContext, PlannerPlan,
    Prebrief, Product, Recommendation, StepModeRecord, TraceArtifact, TraceEvent, Violation,
};
use crate::privacy::{self, PhiBoundaryError};

// ═══════════════════════════════════════════════════════════
// Step names
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepName {
    PhiScrubber,
    IntakeExtraction,
    Triage,
    ProductRanker,
    Safety,
    EvidenceRetrieval,
    ReportComposer,
    Handout,
    Prebrief,
    Planner,
    Trace,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhiScrubber => "phi_scrubber",
            Self::IntakeExtraction => "intake_extraction",
            Self::Triage => "triage",
            Self::ProductRanker => "product_ranker",
            Self::Safety => "safety",
            Self::EvidenceRetrieval => "evidence_retrieval",
            Self::ReportComposer => "report_composer",
            Self::Handout => "handout",
            Self::Prebrief => "prebrief",
            Self::Planner => "planner",
            Self::Trace => "trace",
        }
    }

    /// Steps skipped once triage recommends escalation.
    pub fn skipped_on_escalation(&self) -> bool {
        matches!(
            self,
            Self::ProductRanker | Self::Safety | Self::EvidenceRetrieval
        )
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Phi(#[from] PhiBoundaryError),

    #[error("Missing prior artifact: {0}")]
    MissingArtifact(&'static str),

    #[error("Delegated call failed: {0}")]
    Delegate(#[from] ModelError),

    #[error("Delegated call timed out")]
    DelegateTimeout,

    #[error("Delegated output rejected: {0}")]
    Rejected(&'static str),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Step panicked")]
    Panicked,
}

impl StepError {
    /// Internal code recorded on the `failed` trace event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Phi(_) => "PHI_BOUNDARY",
            Self::MissingArtifact(_) => "MISSING_ARTIFACT",
            Self::Delegate(_) => "DELEGATE_FAILED",
            Self::DelegateTimeout => "DELEGATE_TIMEOUT",
            Self::Rejected(_) => "DELEGATE_REJECTED",
            Self::Database(_) => "STORAGE_ERROR",
            Self::Panicked => "STEP_PANIC",
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Step inputs and outputs
// ═══════════════════════════════════════════════════════════

/// Outputs accumulated so far in a run. Read-only to steps.
#[derive(Debug, Clone, Default)]
pub struct ArtifactBag {
    pub intake: Option<IntakeExtracted>,
    pub recommendation: Option<Recommendation>,
    pub evidence: Option<Vec<EvidenceItem>>,
    pub report: Option<String>,
    pub handout: Option<String>,
    pub prebrief: Option<Prebrief>,
    pub plan: Option<PlannerPlan>,
    pub trace: Option<TraceArtifact>,
}

impl ArtifactBag {
    pub fn apply(&mut self, output: StepOutput) {
        match output {
            StepOutput::Cleared(_) => {}
            StepOutput::Intake(intake) => self.intake = Some(intake),
            StepOutput::Triage {
                intake,
                recommendation,
            } => {
                self.intake = Some(intake);
                self.recommendation = Some(recommendation);
            }
            StepOutput::Recommendation(reco) => self.recommendation = Some(reco),
            StepOutput::Evidence {
                items,
                recommendation,
            } => {
                self.evidence = Some(items);
                self.recommendation = Some(recommendation);
            }
            StepOutput::Report(markdown) => self.report = Some(markdown),
            StepOutput::Handout(markdown) => self.handout = Some(markdown),
            StepOutput::Prebrief(prebrief) => self.prebrief = Some(prebrief),
            StepOutput::Plan(plan) => self.plan = Some(plan),
            StepOutput::Trace(trace) => self.trace = Some(trace),
        }
    }

    pub fn needs_more_info(&self) -> bool {
        self.recommendation
            .as_ref()
            .is_some_and(|r| !r.follow_up_questions.is_empty())
    }

    pub fn escalated(&self) -> bool {
        self.recommendation
            .as_ref()
            .is_some_and(Recommendation::escalation_recommended)
    }

    pub fn intake(&self) -> Result<&IntakeExtracted, StepError> {
        self.intake
            .as_ref()
            .ok_or(StepError::MissingArtifact("intake_extracted"))
    }

    pub fn recommendation(&self) -> Result<&Recommendation, StepError> {
        self.recommendation
            .as_ref()
            .ok_or(StepError::MissingArtifact("recommendation"))
    }

    pub fn into_artifacts(self, step_modes: BTreeMap<String, StepModeRecord>) -> Artifacts {
        Artifacts {
            intake_extracted: self.intake,
            recommendation: self.recommendation,
            evidence_items: self.evidence,
            report_markdown: self.report,
            handout_markdown: self.handout,
            prebrief: self.prebrief,
            plan: self.plan,
            trace: self.trace,
            step_modes,
        }
    }
}

/// What one step produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepOutput {
    /// Input passed the boundary; carries WARN findings.
    Cleared(Vec<Violation>),
    Intake(IntakeExtracted),
    Triage {
        intake: IntakeExtracted,
        recommendation: Recommendation,
    },
    Recommendation(Recommendation),
    Evidence {
        items: Vec<EvidenceItem>,
        recommendation: Recommendation,
    },
    Report(String),
    Handout(String),
    Prebrief(Prebrief),
    Plan(PlannerPlan),
    Trace(TraceArtifact),
}

impl StepOutput {
    /// PHI boundary findings for the produced artifact.
    pub fn phi_findings(&self) -> Vec<Violation> {
        match self {
            Self::Cleared(warnings) => warnings.clone(),
            Self::Intake(intake) => {
                privacy::scan_artifact(intake, "$.artifacts.intake_extracted")
            }
            Self::Triage {
                intake,
                recommendation,
            } => {
                let mut v = privacy::scan_artifact(intake, "$.artifacts.intake_extracted");
                v.extend(privacy::scan_artifact(
                    recommendation,
                    "$.artifacts.recommendation",
                ));
                v
            }
            Self::Recommendation(reco) => {
                privacy::scan_artifact(reco, "$.artifacts.recommendation")
            }
            Self::Evidence {
                items,
                recommendation,
            } => {
                let mut v = privacy::scan_artifact(items, "$.artifacts.evidence_items");
                v.extend(privacy::scan_artifact(
                    recommendation,
                    "$.artifacts.recommendation",
                ));
                v
            }
            Self::Report(markdown) => privacy::scan_text(markdown, "$.artifacts.report_markdown"),
            Self::Handout(markdown) => {
                privacy::scan_text(markdown, "$.artifacts.handout_markdown")
            }
            Self::Prebrief(prebrief) => privacy::scan_artifact(prebrief, "$.artifacts.prebrief"),
            Self::Plan(plan) => privacy::scan_artifact(plan, "$.artifacts.plan"),
            Self::Trace(trace) => privacy::scan_artifact(trace, "$.artifacts.trace"),
        }
    }

    /// Length and hash prefix of the serialized output, for PHI events.
    pub fn fingerprint(&self) -> (usize, String) {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        (bytes.len(), privacy::sha256_12(&bytes))
    }
}

/// Output plus the step's own tool/rule events.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: StepOutput,
    pub events: Vec<TraceEvent>,
}

impl StepOutcome {
    pub fn new(output: StepOutput) -> Self {
        Self {
            output,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: TraceEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Everything a step may read.
pub struct StepContext<'a> {
    pub run_id: &'a str,
    /// Dataset visit the run analyzes, when it came from one.
    pub visit_ref: Option<&'a str>,
    pub language: Language,
    /// Raw intake text. Only the boundary and extraction steps read it.
    pub intake_text: &'a str,
    pub patient: &'a PatientContext,
    pub products: &'a [Product],
    pub prefilled_intake: Option<&'a IntakeExtracted>,
    pub answers: &'a AnswerMap,
    pub bag: &'a ArtifactBag,
    pub trace: &'a TraceHub,
}

impl StepContext<'_> {
    pub fn tool_event(&self, step: StepName, tool: &str, summary: impl Into<String>) -> TraceEvent {
        TraceEvent::new(EventType::ToolResult)
            .step(step.as_str())
            .tool(tool, summary)
    }

    /// Length and hash prefix of the intake text.
    pub fn intake_fingerprint(&self) -> (usize, String) {
        (
            self.intake_text.chars().count(),
            privacy::sha256_12(self.intake_text.as_bytes()),
        )
    }
}

/// Prompt pair for the delegated variant of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub system: String,
    pub prompt: String,
}

/// One pipeline step: a deterministic variant, and optionally a delegated
/// variant that hands a prompt to the model boundary.
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> StepName;

    /// Deterministic variant. Also the fallback for the delegated one.
    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError>;

    /// Prompt for the delegated variant, `None` when this step (or this
    /// particular input) is deterministic only.
    fn delegation(&self, _ctx: &StepContext<'_>) -> Option<Delegation> {
        None
    }

    /// Validate a model answer. Any error falls back (or fails the step).
    fn accept(&self, _ctx: &StepContext<'_>, _raw: &str) -> Result<StepOutcome, StepError> {
        Err(StepError::Rejected("step has no delegated variant"))
    }

    /// Whether a failed delegation may fall back to `run`.
    fn has_fallback(&self) -> bool {
        true
    }
}

/// Static registration table, in execution order.
pub static REGISTRY: [&dyn PipelineStep; 11] = [
    &phi_scrub::PhiScrubber,
    &intake::IntakeExtraction,
    &triage::Triage,
    &ranker::ProductRanker,
    &safety::SafetyEngine,
    &evidence::EvidenceRetrieval,
    &report::ReportComposer,
    &handout::HandoutComposer,
    &prebrief::PrebriefComposer,
    &planner::Planner,
    &trace_assembly::TraceAssembly,
];

pub fn step(name: StepName) -> &'static dyn PipelineStep {
    // REGISTRY is declared in StepName order.
    REGISTRY[name as usize]
}
