//! Patient handout. Deterministic only; a lint hit swaps in the minimal
//! fixed handout instead of failing the run.

use super::report::safe_text;
use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{Language, Recommendation, Severity};
use crate::pipeline::lint::lint_rx_advice;
use crate::pipeline::text::truncate_chars;

const MAX_HANDOUT_CHARS: usize = 12_000;
const MAX_PRODUCTS: usize = 3;

const MINIMAL_EN: &str = "# Patient handout\n\n\
- Follow your pharmacist instructions.\n\
- If symptoms worsen, consult a doctor.\n\
- Do not change prescription treatment without medical advice.\n";

const MINIMAL_FR: &str = "# Fiche patient\n\n\
- Suivez les conseils du pharmacien.\n\
- Si les symptomes s'aggravent, consultez un medecin.\n\
- Ne modifiez pas votre traitement sur ordonnance sans avis medical.\n";

pub fn minimal_handout(language: Language) -> &'static str {
    match language {
        Language::En => MINIMAL_EN,
        Language::Fr => MINIMAL_FR,
    }
}

pub fn render_handout(reco: &Recommendation, language: Language) -> String {
    let fr = language == Language::Fr;
    let pick = |en: &'static str, fr_text: &'static str| if fr { fr_text } else { en };

    let mut lines = vec![
        pick("# Patient handout", "# Fiche patient").to_string(),
        String::new(),
        pick(
            "- Scope: OTC/parapharmacy guidance only.",
            "- Perimetre: conseils OTC/parapharmacie uniquement.",
        )
        .to_string(),
        pick(
            "- Note: Do not change prescription treatment without medical advice.",
            "- Note: Ne modifiez pas votre traitement sur ordonnance sans avis medical.",
        )
        .to_string(),
    ];

    if let Some(esc) = reco.escalation.as_ref().filter(|e| e.recommended) {
        lines.push(String::new());
        lines.push(pick("## When to seek care", "## Quand consulter").to_string());
        lines.push(format!("- {}", safe_text(&esc.reason)));
        lines.push(format!("- Service: {}", safe_text(&esc.suggested_service)));
    } else if !reco.ranked_products.is_empty() {
        lines.push(String::new());
        lines.push(pick("## Suggested products", "## Produits proposes").to_string());
        for p in reco.ranked_products.iter().take(MAX_PRODUCTS) {
            lines.push(format!("- {}: {}", safe_text(&p.product_sku), safe_text(&p.why)));
        }
    }

    lines.push(String::new());
    lines.push(pick("## What to do now", "## A faire").to_string());
    lines.push(
        pick(
            "- Follow your pharmacist instructions.",
            "- Suivez les conseils du pharmacien.",
        )
        .to_string(),
    );
    lines.push(
        pick(
            "- Monitor symptoms; if worsening, seek care.",
            "- Surveillez les symptomes; si aggravation, consultez.",
        )
        .to_string(),
    );

    truncate_chars(&lines.join("\n"), MAX_HANDOUT_CHARS)
}

pub struct HandoutComposer;

impl PipelineStep for HandoutComposer {
    fn name(&self) -> StepName {
        StepName::Handout
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let reco = ctx.bag.recommendation()?;
        let rendered = render_handout(reco, ctx.language);
        let blocked = lint_rx_advice(&rendered, "$.artifacts.handout_markdown")
            .iter()
            .any(|v| v.severity == Severity::Blocker);

        let (markdown, mode) = if blocked {
            tracing::warn!(run_id = %ctx.run_id, "Handout failed rx lint, using minimal handout");
            (minimal_handout(ctx.language).to_string(), "minimal")
        } else {
            (rendered, "template")
        };
        Ok(StepOutcome::new(StepOutput::Handout(markdown))
            .with_event(ctx.tool_event(self.name(), "handout_composer", format!("mode={mode}"))))
    }

    fn has_fallback(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankedProduct;
    use crate::pipeline::steps::testing::Fixture;

    fn handout(fx: &Fixture) -> (String, String) {
        let outcome = HandoutComposer.run(&fx.ctx()).unwrap();
        let summary = outcome.events[0].result_summary.clone().unwrap_or_default();
        match outcome.output {
            StepOutput::Handout(md) => (md, summary),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn completed_run_lists_top_products() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.advance_to(StepName::Handout);
        let (md, summary) = handout(&fx);
        assert_eq!(summary, "mode=template");
        assert!(md.starts_with("# Patient handout"));
        assert!(md.contains("## Suggested products"));
        assert!(md.contains("- SKU-ALG-001: Category match"));
        assert!(!md.contains("## When to seek care"));
    }

    #[test]
    fn escalated_run_points_to_care() {
        let mut fx = Fixture::for_case("case_redflag_000101", Language::Fr);
        fx.advance_to(StepName::Handout);
        let (md, _) = handout(&fx);
        assert!(md.starts_with("# Fiche patient"));
        assert!(md.contains("## Quand consulter"));
        assert!(md.contains("- Service: SAMU / Urgences (15/112)"));
        assert!(!md.contains("## Produits proposes"));
    }

    #[test]
    fn rx_advice_in_product_text_swaps_to_minimal() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.advance_to(StepName::Handout);
        let mut reco = fx.bag.recommendation.clone().unwrap();
        reco.ranked_products = vec![RankedProduct {
            product_sku: "SKU-X".into(),
            product_name: None,
            score_0_100: 50,
            why: "stop your prescription medication".into(),
            evidence_refs: vec![],
        }];
        fx.bag.recommendation = Some(reco);
        let (md, summary) = handout(&fx);
        assert_eq!(summary, "mode=minimal");
        assert_eq!(md, MINIMAL_EN);
    }

    #[test]
    fn template_passes_its_own_lint() {
        for language in [Language::En, Language::Fr] {
            assert!(lint_rx_advice(minimal_handout(language), "$").is_empty());
        }
    }
}
