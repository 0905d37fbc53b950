use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::privacy::{self, PhiBoundaryError};

/// Boundary on the raw intake text. Runs before anything reads it.
pub struct PhiScrubber;

impl PipelineStep for PhiScrubber {
    fn name(&self) -> StepName {
        StepName::PhiScrubber
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let findings = privacy::scan_text(ctx.intake_text, "$.intake_text_ocr");
        if findings.iter().any(|v| v.is_blocker()) {
            return Err(PhiBoundaryError {
                violations: findings,
            }
            .into());
        }

        let (len, _) = ctx.intake_fingerprint();
        let summary = format!("input_len={len} warnings={}", findings.len());
        Ok(StepOutcome::new(StepOutput::Cleared(findings)).with_event(ctx.tool_event(
            self.name(),
            "phi_boundary",
            summary,
        )))
    }

    fn has_fallback(&self) -> bool {
        false
    }
}
