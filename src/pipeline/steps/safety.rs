use std::collections::HashMap;

use super::ranker::{has_tag, matches_allergy, pregnancy_status, pregnancy_unknown_warning, PregnancyStatus};
use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{dedupe_warnings, Product, Recommendation, SafetyWarning, Severity};

/// Warnings for the ranked products and the escalation, never advice.
pub fn compute_safety_warnings(ctx: &StepContext<'_>, recommendation: &Recommendation) -> Vec<SafetyWarning> {
    let pregnancy = pregnancy_status(ctx.patient, ctx.answers);
    let allergy_terms = ctx.patient.allergy_terms();
    let by_sku: HashMap<&str, &Product> =
        ctx.products.iter().map(|p| (p.sku.as_str(), p)).collect();

    let mut out = Vec::new();
    if let Some(escalation) = recommendation.escalation.as_ref().filter(|e| e.recommended) {
        out.push(SafetyWarning {
            code: "ESCALATION_RECOMMENDED".to_string(),
            severity: Severity::Warn,
            message: escalation.reason.clone(),
            related_product_sku: None,
        });
    }

    for ranked in &recommendation.ranked_products {
        let Some(product) = by_sku.get(ranked.product_sku.as_str()) else {
            continue;
        };
        let sku = Some(ranked.product_sku.clone());

        if matches_allergy(product, &allergy_terms) {
            out.push(SafetyWarning {
                code: "ALLERGY_MATCH".to_string(),
                severity: Severity::Blocker,
                message: "Patient allergy may match a product ingredient.".to_string(),
                related_product_sku: sku.clone(),
            });
        }
        if pregnancy == PregnancyStatus::Unknown && has_tag(product, "pregnancy_unknown") {
            out.push(pregnancy_unknown_warning(&ranked.product_sku));
        }
        if pregnancy == PregnancyStatus::Pregnant && has_tag(product, "pregnancy_contraindicated") {
            out.push(SafetyWarning {
                code: "PREGNANCY_CONTRAINDICATED".to_string(),
                severity: Severity::Blocker,
                message: "Contraindicated in pregnancy.".to_string(),
                related_product_sku: sku,
            });
        }
    }
    dedupe_warnings(out)
}

pub struct SafetyEngine;

impl PipelineStep for SafetyEngine {
    fn name(&self) -> StepName {
        StepName::Safety
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let mut recommendation = ctx.bag.recommendation()?.clone();
        let added = compute_safety_warnings(ctx, &recommendation);
        let summary = format!("safety_warnings_added={}", added.len());

        let mut merged = std::mem::take(&mut recommendation.safety_warnings);
        merged.extend(added);
        recommendation.safety_warnings = dedupe_warnings(merged);

        Ok(StepOutcome::new(StepOutput::Recommendation(recommendation))
            .with_event(ctx.tool_event(self.name(), "safety_engine", summary)))
    }
}
