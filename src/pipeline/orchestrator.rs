//! Run state machine.
//!
//! `created → running → {needs_more_info | completed | failed}`. A run is
//! never resumed: a follow-up creates a new run whose input carries the
//! prior run's answers merged with the new ones.
//!
//! Preparation (validation, reference resolution, the `runs` row) happens
//! on the request path so callers get a 4xx before anything is spawned.
//! Execution is a single task per run; steps run strictly in registry
//! order against a bag owned by that task.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::executor::{record_failure, StepFailure};
use super::follow_up::{merge_answers, validate_answers, AnswerMap, FollowUpError};
use super::steps::{ArtifactBag, StepContext, StepName, REGISTRY};
use crate::cases::{load_case_bundle, CaseError};
use crate::core_state::{CoreError, CoreState};
use crate::db::{self, DatabaseError};
use crate::models::{
    Artifacts, EventType, FollowUpAnswer, InputError, IntakeExtracted, PatientContext, Product,
    Recommendation, Run, RunInput, RunReference, RunStatus, StepModeRecord, TraceArtifact, TraceEvent, Violation,
};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Answers(#[from] FollowUpError),

    #[error("Unknown {0}")]
    NotFound(&'static str),

    #[error("Run {0} has not finished yet")]
    RunNotTerminal(String),

    #[error(transparent)]
    Case(CaseError),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Resolved inputs of one run. Owned by the executing task.
#[derive(Debug, Clone)]
pub struct RunBundle {
    pub intake_text: String,
    pub patient: PatientContext,
    pub products: Vec<Product>,
    pub prefilled_intake: Option<IntakeExtracted>,
}

/// A persisted `created` run plus its resolved bundle.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run: Run,
    pub bundle: RunBundle,
}

// ═══════════════════════════════════════════════════════════
// Preparation
// ═══════════════════════════════════════════════════════════

fn resolve(
    core: &CoreState,
    reference: &RunReference,
    input: &RunInput,
) -> Result<RunBundle, OrchestratorError> {
    match reference {
        RunReference::Case(case_ref) => {
            let bundle = load_case_bundle(case_ref).map_err(|e| match e {
                CaseError::NotFound(_) => OrchestratorError::NotFound("case_ref"),
                other => OrchestratorError::Case(other),
            })?;
            Ok(RunBundle {
                intake_text: bundle.intake_text_ocr.for_language(input.language).to_string(),
                patient: bundle.llm_context,
                products: bundle.products,
                prefilled_intake: None,
            })
        }
        RunReference::Visit {
            patient_ref,
            visit_ref,
        } => {
            let conn = core.open_db()?;
            let visit = db::get_visit(&conn, visit_ref)?
                .ok_or(OrchestratorError::NotFound("visit_ref"))?;
            if patient_ref.as_deref().is_some_and(|p| p != visit.patient_ref) {
                // Same outcome as an unknown visit: no cross-patient probing.
                return Err(OrchestratorError::NotFound("visit_ref"));
            }
            let patient = db::get_patient(&conn, &visit.patient_ref)?
                .ok_or(OrchestratorError::NotFound("patient_ref"))?;
            Ok(RunBundle {
                intake_text: String::new(),
                patient: patient.llm_context,
                products: db::list_products(&conn)?,
                prefilled_intake: visit.intake_extracted,
            })
        }
    }
}

/// Validate the input, resolve its reference and persist a `created` run.
pub fn prepare_run(core: &CoreState, mut input: RunInput) -> Result<PreparedRun, OrchestratorError> {
    let reference = input.reference()?;
    input.follow_up_answers = validate_answers(&input.follow_up_answers)?;
    let bundle = resolve(core, &reference, &input)?;

    let run = Run::new(input);
    let conn = core.open_db()?;
    db::insert_run(&conn, &run)?;
    tracing::info!(
        run_id = %run.run_id,
        language = %run.input.language,
        answers = run.input.follow_up_answers.len(),
        "Run created"
    );
    Ok(PreparedRun { run, bundle })
}

/// New run for the prior run's reference with merged answers.
pub fn prepare_follow_up(
    core: &CoreState,
    prior_run_id: &str,
    answers: &[FollowUpAnswer],
) -> Result<PreparedRun, OrchestratorError> {
    let prior = {
        let conn = core.open_db()?;
        db::get_run(&conn, prior_run_id)?.ok_or(OrchestratorError::NotFound("run"))?
    };
    if !prior.status.is_terminal() {
        return Err(OrchestratorError::RunNotTerminal(prior.run_id));
    }

    let new_answers = validate_answers(answers)?;
    let mut input = prior.input;
    input.follow_up_answers = merge_answers(&input.follow_up_answers, &new_answers);
    tracing::info!(prior_run_id = %prior.run_id, "Follow-up run requested");
    prepare_run(core, input)
}

// ═══════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════

fn finalized_message(status: RunStatus, escalated: bool) -> &'static str {
    match status {
        RunStatus::NeedsMoreInfo => "Run needs_more_info (follow-up required).",
        _ if escalated => "Run completed (escalation recommended).",
        _ => "Run completed.",
    }
}

/// Terminal event matching a persisted terminal row.
fn terminal_event(run: &Run) -> TraceEvent {
    match run.status {
        RunStatus::Failed => TraceEvent::new(EventType::Failed)
            .message("Run aborted.")
            .error_code("RUN_ABORTED"),
        status => {
            let escalated = run
                .artifacts
                .recommendation
                .as_ref()
                .is_some_and(Recommendation::escalation_recommended);
            TraceEvent::new(EventType::Finalized).message(finalized_message(status, escalated))
        }
    }
}

fn snapshot_trace(core: &CoreState, run_id: &str) -> Option<TraceArtifact> {
    let events = core.trace().list(run_id).ok()?;
    Some(TraceArtifact {
        trace_id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        events,
    })
}

/// Persist the failed run (metadata only), then record the failure events.
fn fail_run(
    core: &CoreState,
    run_id: &str,
    failure: &StepFailure,
    step_modes: BTreeMap<String, StepModeRecord>,
    mut violations: Vec<Violation>,
) -> Result<RunStatus, OrchestratorError> {
    violations.extend(failure.violations());
    let artifacts = Artifacts {
        trace: snapshot_trace(core, run_id),
        step_modes,
        ..Artifacts::default()
    };
    tracing::warn!(
        run_id = %run_id,
        step = %failure.step,
        code = failure.error.code(),
        "Run failed"
    );
    let conn = core.open_db()?;
    db::finish_run(&conn, run_id, RunStatus::Failed, &artifacts, &violations)?;
    record_failure(core.trace(), run_id, failure);
    Ok(RunStatus::Failed)
}

async fn drive(core: &CoreState, prepared: &PreparedRun) -> Result<RunStatus, OrchestratorError> {
    let run_id = prepared.run.run_id.as_str();
    {
        let conn = core.open_db()?;
        db::update_run_status(&conn, run_id, RunStatus::Running)?;
    }

    let answers = AnswerMap::from_answers(&prepared.run.input.follow_up_answers);
    let mut bag = ArtifactBag::default();
    let mut step_modes = BTreeMap::new();
    let mut warnings: Vec<Violation> = Vec::new();

    for step in REGISTRY.iter() {
        let name = step.name();
        if bag.needs_more_info() && name != StepName::Trace {
            continue;
        }
        if bag.escalated() && name.skipped_on_escalation() {
            continue;
        }

        let result = {
            let ctx = StepContext {
                run_id,
                visit_ref: prepared.run.input.visit_ref.as_deref(),
                language: prepared.run.input.language,
                intake_text: &prepared.bundle.intake_text,
                patient: &prepared.bundle.patient,
                products: &prepared.bundle.products,
                prefilled_intake: prepared.bundle.prefilled_intake.as_ref(),
                answers: &answers,
                bag: &bag,
                trace: core.trace(),
            };
            core.executor().execute(*step, &ctx).await
        };

        match result {
            Ok(done) => {
                step_modes.insert(name.as_str().to_string(), done.mode);
                warnings.extend(done.warnings);
                bag.apply(done.output);
            }
            Err(failure) => return fail_run(core, run_id, &failure, step_modes, warnings),
        }
    }

    let status = if bag.needs_more_info() {
        RunStatus::NeedsMoreInfo
    } else {
        RunStatus::Completed
    };
    let message = finalized_message(status, bag.escalated());
    let artifacts = bag.into_artifacts(step_modes);
    {
        let conn = core.open_db()?;
        db::finish_run(&conn, run_id, status, &artifacts, &warnings)?;
    }
    core.trace()
        .emit(run_id, TraceEvent::new(EventType::Finalized).message(message))?;
    tracing::info!(run_id = %run_id, status = %status, "Run finished");
    Ok(status)
}

/// Terminal row of a broken-off run, persisting `failed` if the row is not
/// terminal yet. `None` when its terminal event is already recorded.
fn settle_aborted(core: &CoreState, run_id: &str) -> Result<Option<Run>, OrchestratorError> {
    if core
        .trace()
        .list(run_id)?
        .iter()
        .any(|e| e.event.event_type.is_terminal())
    {
        return Ok(None);
    }
    let conn = core.open_db()?;
    let current = db::get_run(&conn, run_id)?.ok_or(OrchestratorError::NotFound("run"))?;
    if current.status.is_terminal() {
        tracing::warn!(run_id = %run_id, status = %current.status, "Run persisted without terminal event");
        return Ok(Some(current));
    }
    db::finish_run(&conn, run_id, RunStatus::Failed, &Artifacts::default(), &[])?;
    Ok(db::get_run(&conn, run_id)?)
}

/// End a run whose execution broke off. A row that already reached a
/// terminal state keeps it and only gets its missing terminal event. If no
/// terminal event can be stored, live readers are cut loose.
fn abort_run(core: &CoreState, run_id: &str) {
    let recorded = settle_aborted(core, run_id).and_then(|run| match run {
        Some(run) => core
            .trace()
            .emit(run_id, terminal_event(&run))
            .map(|_| ())
            .map_err(OrchestratorError::from),
        None => Ok(()),
    });
    if let Err(e) = recorded {
        tracing::error!(run_id = %run_id, error = %e, "Failed to record run termination");
        core.trace().close(run_id);
    }
}

/// Execute a prepared run to its terminal state. Never panics and never
/// returns an error: anything unexpected ends the run as `failed`.
pub async fn execute_run(core: &CoreState, prepared: PreparedRun) -> RunStatus {
    let run_id = prepared.run.run_id.as_str();
    match drive(core, &prepared).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Run aborted");
            abort_run(core, run_id);
            core.open_db()
                .ok()
                .and_then(|conn| db::get_run(&conn, run_id).ok().flatten())
                .map(|run| run.status)
                .filter(RunStatus::is_terminal)
                .unwrap_or(RunStatus::Failed)
        }
    }
}

/// Run the pipeline in the background.
pub fn spawn_run(core: Arc<CoreState>, prepared: PreparedRun) -> JoinHandle<RunStatus> {
    tokio::spawn(async move { execute_run(&core, prepared).await })
}

/// Prepare and execute in the caller's task, returning the final snapshot.
pub async fn run_to_completion(core: &CoreState, input: RunInput) -> Result<Run, OrchestratorError> {
    let prepared = prepare_run(core, input)?;
    let run_id = prepared.run.run_id.clone();
    execute_run(core, prepared).await;
    let conn = core.open_db()?;
    db::get_run(&conn, &run_id)?.ok_or(OrchestratorError::NotFound("run"))
}
