//! Step executor: runs one registered step, delegated or deterministic,
//! and frames it with `step_started` / `step_completed` events.
//!
//! Failures are returned to the orchestrator, which persists the run
//! before recording them, so the terminal `failed` event is always the
//! last thing a stream reader sees.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::model_client::ModelClient;
use super::steps::{Delegation, PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use super::trace::TraceHub;
use crate::models::{EventType, StepMode, StepModeRecord, TraceEvent, Violation};
use crate::privacy::{self, PhiBoundaryError};

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(20);

/// A step that produced an artifact which passed the boundary.
#[derive(Debug)]
pub struct ExecutedStep {
    pub output: StepOutput,
    pub mode: StepModeRecord,
    /// WARN findings on the output; BLOCKERs never get this far.
    pub warnings: Vec<Violation>,
}

/// A step that failed. The offending content is never carried, only its
/// length and hash prefix.
#[derive(Debug)]
pub struct StepFailure {
    pub step: StepName,
    pub error: StepError,
    pub fingerprint: Option<(usize, String)>,
}

impl StepFailure {
    pub fn violations(&self) -> Vec<Violation> {
        match &self.error {
            StepError::Phi(phi) => phi.violations.clone(),
            _ => Vec::new(),
        }
    }
}

/// Emit `policy_violation` (PHI failures only) then the terminal `failed`.
pub fn record_failure(hub: &TraceHub, run_id: &str, failure: &StepFailure) {
    let step = failure.step.as_str();
    if let StepError::Phi(phi) = &failure.error {
        let mut event = TraceEvent::new(EventType::PolicyViolation)
            .step(step)
            .message("PHI boundary violation.")
            .violations(phi.violations.clone());
        if let Some((len, sha)) = &failure.fingerprint {
            event = event.input_fingerprint(*len, sha.clone());
        }
        emit_logged(hub, run_id, event);
    }
    let failed = TraceEvent::new(EventType::Failed)
        .step(step)
        .message(format!("Step {step} failed."))
        .error_code(failure.error.code());
    if let Err(e) = hub.emit(run_id, failed) {
        tracing::error!(run_id = %run_id, error = %e, "Failed to record terminal event");
        hub.close(run_id);
    }
}

fn emit_logged(hub: &TraceHub, run_id: &str, event: TraceEvent) {
    if let Err(e) = hub.emit(run_id, event) {
        tracing::error!(run_id = %run_id, error = %e, "Failed to record trace event");
    }
}

fn run_guarded(step: &dyn PipelineStep, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
    catch_unwind(AssertUnwindSafe(|| step.run(ctx))).unwrap_or(Err(StepError::Panicked))
}

fn record(mode: StepMode, fallback_used: bool) -> StepModeRecord {
    StepModeRecord {
        mode,
        fallback_used,
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    model: Option<Arc<dyn ModelClient>>,
    timeout: Duration,
}

impl StepExecutor {
    /// Every step runs its deterministic variant.
    pub fn deterministic() -> Self {
        Self {
            model: None,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_model(model: Arc<dyn ModelClient>, timeout: Duration) -> Self {
        Self {
            model: Some(model),
            timeout,
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub async fn execute(
        &self,
        step: &dyn PipelineStep,
        ctx: &StepContext<'_>,
    ) -> Result<ExecutedStep, StepFailure> {
        let name = step.name();
        let fail = |error: StepError, fingerprint: Option<(usize, String)>| StepFailure {
            step: name,
            error,
            fingerprint,
        };

        ctx.trace
            .emit(
                ctx.run_id,
                TraceEvent::new(EventType::StepStarted)
                    .step(name.as_str())
                    .message(format!("Starting {name}.")),
            )
            .map_err(|e| fail(e.into(), None))?;

        let (outcome, mode) = match self.produce(step, ctx).await {
            Ok(produced) => produced,
            Err(error) => {
                let fingerprint = matches!(error, StepError::Phi(_)).then(|| ctx.intake_fingerprint());
                return Err(fail(error, fingerprint));
            }
        };

        let findings = outcome.output.phi_findings();
        if findings.iter().any(Violation::is_blocker) {
            tracing::warn!(run_id = %ctx.run_id, step = %name, "Step output blocked at PHI boundary");
            let fingerprint = Some(outcome.output.fingerprint());
            return Err(fail(
                PhiBoundaryError {
                    violations: findings,
                }
                .into(),
                fingerprint,
            ));
        }

        for event in outcome.events {
            ctx.trace
                .emit(ctx.run_id, event)
                .map_err(|e| fail(e.into(), None))?;
        }
        ctx.trace
            .emit(
                ctx.run_id,
                TraceEvent::new(EventType::StepCompleted)
                    .step(name.as_str())
                    .message(format!("Completed {name}.")),
            )
            .map_err(|e| fail(e.into(), None))?;

        Ok(ExecutedStep {
            output: outcome.output,
            mode,
            warnings: findings,
        })
    }

    async fn produce(
        &self,
        step: &dyn PipelineStep,
        ctx: &StepContext<'_>,
    ) -> Result<(StepOutcome, StepModeRecord), StepError> {
        let name = step.name();
        let delegated = match self.model.as_ref().and_then(|m| Some((m, step.delegation(ctx)?))) {
            Some((model, delegation)) => {
                Some(self.delegate(step, ctx, Arc::clone(model), delegation).await)
            }
            None => None,
        };

        match delegated {
            None => Ok((run_guarded(step, ctx)?, record(StepMode::Deterministic, false))),
            Some(Ok(outcome)) => Ok((
                outcome.with_event(ctx.tool_event(name, "model", "mode=delegated")),
                record(StepMode::Delegated, false),
            )),
            Some(Err(error)) if step.has_fallback() && !matches!(error, StepError::Phi(_)) => {
                let code = match &error {
                    StepError::Delegate(model_error) => model_error.code(),
                    other => other.code(),
                };
                tracing::warn!(run_id = %ctx.run_id, step = %name, code, "Delegated step failed, using deterministic fallback");
                let outcome = run_guarded(step, ctx)?;
                Ok((
                    outcome.with_event(ctx.tool_event(name, "model", format!("mode=fallback code={code}"))),
                    record(StepMode::Fallback, true),
                ))
            }
            Some(Err(error)) => Err(error),
        }
    }

    async fn delegate(
        &self,
        step: &dyn PipelineStep,
        ctx: &StepContext<'_>,
        model: Arc<dyn ModelClient>,
        delegation: Delegation,
    ) -> Result<StepOutcome, StepError> {
        privacy::raise_if_phi(&delegation.prompt, "$.delegation.prompt")?;

        let Delegation { system, prompt } = delegation;
        tracing::debug!(run_id = %ctx.run_id, step = %step.name(), model = model.model_name(), prompt_len = prompt.len(), "Delegating step");
        let call = tokio::task::spawn_blocking(move || model.generate(&prompt, &system));
        let raw = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => return Err(StepError::DelegateTimeout),
            Ok(Err(_)) => return Err(StepError::Panicked),
            Ok(Ok(generated)) => generated?,
        };

        catch_unwind(AssertUnwindSafe(|| step.accept(ctx, &raw))).unwrap_or(Err(StepError::Panicked))
    }
}
