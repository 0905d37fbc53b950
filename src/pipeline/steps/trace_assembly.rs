use uuid::Uuid;

use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::TraceArtifact;

/// Snapshot of the run's persisted events at the time the step runs.
pub struct TraceAssembly;

impl PipelineStep for TraceAssembly {
    fn name(&self) -> StepName {
        StepName::Trace
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let events = ctx.trace.list(ctx.run_id)?;
        Ok(StepOutcome::new(StepOutput::Trace(TraceArtifact {
            trace_id: Uuid::new_v4().to_string(),
            run_id: ctx.run_id.to_string(),
            events,
        })))
    }

    fn has_fallback(&self) -> bool {
        false
    }
}
