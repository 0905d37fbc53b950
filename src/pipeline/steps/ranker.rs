//! Deterministic OTC product ranking.
//!
//! Score = category match (60 / 40 / 10, or 20 when no category is
//! inferred) + ingredient match (30 / 10) + stock bonus (0..=10).

use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{
    dedupe_warnings, IntakeExtracted, PatientContext, Product, RankedProduct, SafetyWarning,
    Severity,
};
use crate::pipeline::follow_up::AnswerMap;
use crate::pipeline::text::is_yes;

const TOP_K: usize = 3;
const MAX_WHY_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PregnancyStatus {
    NotApplicable,
    Pregnant,
    NotPregnant,
    Unknown,
}

/// Context first, then the `q_pregnancy` answer. Male patients are not
/// applicable.
pub fn pregnancy_status(patient: &PatientContext, answers: &AnswerMap) -> PregnancyStatus {
    if patient.is_male() {
        return PregnancyStatus::NotApplicable;
    }
    match patient.pregnancy_status.as_deref().map(str::trim) {
        Some("pregnant") => return PregnancyStatus::Pregnant,
        Some("unknown") => return PregnancyStatus::Unknown,
        Some(s) if !s.is_empty() => return PregnancyStatus::NotPregnant,
        _ => {}
    }
    match answers.get("q_pregnancy") {
        Some(answer) if is_yes(Some(answer)) => PregnancyStatus::Pregnant,
        Some(_) => PregnancyStatus::NotPregnant,
        None => PregnancyStatus::Unknown,
    }
}

/// Any allergy term found in the product name, brand or ingredients.
pub fn matches_allergy(product: &Product, allergy_terms: &[String]) -> bool {
    if allergy_terms.is_empty() {
        return false;
    }
    let haystack = format!(
        "{} {} {}",
        product.name,
        product.brand,
        product.ingredients.join(" ")
    )
    .to_lowercase();
    allergy_terms.iter().any(|t| haystack.contains(t.as_str()))
}

/// Product category the intake points at, `general` when none.
pub fn target_category(intake: &IntakeExtracted) -> &'static str {
    let blob = intake.label_blob();
    let has = |needles: &[&str]| needles.iter().any(|n| blob.contains(n));
    if has(&["sneez", "itchy eye", "allergic", "eternu"]) {
        "allergy"
    } else if has(&["bloat", "ballonn", "gas", "indigestion"]) {
        "digestion"
    } else if has(&["dry skin", "peau", "eczema", "itchy skin"]) {
        "dermatology"
    } else {
        "general"
    }
}

fn ingredient_keywords(category: &str) -> &'static [&'static str] {
    match category {
        "allergy" => &["cetirizine", "loratadine", "antihist"],
        "digestion" => &["simethicone", "probiotic", "antacid"],
        "dermatology" => &["glycerin", "urea", "emollient"],
        _ => &[],
    }
}

fn score_product(
    product: &Product,
    target: &str,
    pregnancy: PregnancyStatus,
) -> (u8, String) {
    let category = product.category.to_lowercase();
    let category_score = match target {
        "general" => 20,
        t if category == t => 60,
        t if category.contains(t) => 40,
        _ => 10,
    };

    let keywords = ingredient_keywords(target);
    let ingredients = product.ingredients.join(" ").to_lowercase();
    let ingredient_score = if keywords.iter().any(|k| ingredients.contains(k)) {
        30
    } else if !keywords.is_empty() {
        10
    } else {
        0
    };

    let stock_score = if product.stock_qty > 0 {
        let ratio = f64::from(product.stock_qty.min(50)) / 50.0;
        ((ratio * 10.0).round() as u32).min(10)
    } else {
        0
    };

    let score = (category_score + ingredient_score + stock_score).min(100) as u8;

    let mut why = vec![format!("Category match: {target}")];
    if ingredient_score >= 30 {
        why.push("Key ingredient match".to_string());
    }
    if stock_score > 0 {
        why.push("In stock".to_string());
    }
    if pregnancy == PregnancyStatus::Unknown && has_tag(product, "pregnancy_unknown") {
        why.push("Confirm pregnancy status".to_string());
    }
    let why: String = why.join("; ").chars().take(MAX_WHY_CHARS).collect();
    (score, why)
}

pub(crate) fn has_tag(product: &Product, tag: &str) -> bool {
    product
        .contraindication_tags
        .iter()
        .any(|t| t.eq_ignore_ascii_case(tag))
}

pub(crate) fn pregnancy_unknown_warning(sku: &str) -> SafetyWarning {
    SafetyWarning {
        code: "PREGNANCY_STATUS_UNKNOWN".to_string(),
        severity: Severity::Warn,
        message: "Pregnancy status is unknown. Confirm before recommending if relevant."
            .to_string(),
        related_product_sku: Some(sku.to_string()),
    }
}

/// Ranked top products plus the warnings behind every exclusion.
pub fn rank_products(
    intake: &IntakeExtracted,
    patient: &PatientContext,
    answers: &AnswerMap,
    products: &[Product],
) -> (Vec<RankedProduct>, Vec<SafetyWarning>) {
    let pregnancy = pregnancy_status(patient, answers);
    let allergy_terms = patient.allergy_terms();
    let target = target_category(intake);

    let mut scored: Vec<(u8, &Product, String)> = Vec::new();
    let mut warnings = Vec::new();

    for product in products.iter().filter(|p| p.in_stock && !p.sku.is_empty()) {
        if matches_allergy(product, &allergy_terms) {
            warnings.push(SafetyWarning {
                code: "ALLERGY_MATCH".to_string(),
                severity: Severity::Blocker,
                message: "Patient allergy may match a product ingredient; excluded from ranking."
                    .to_string(),
                related_product_sku: Some(product.sku.clone()),
            });
            continue;
        }
        if pregnancy == PregnancyStatus::Pregnant && has_tag(product, "pregnancy_contraindicated")
        {
            warnings.push(SafetyWarning {
                code: "PREGNANCY_CONTRAINDICATED".to_string(),
                severity: Severity::Blocker,
                message: "Contraindicated in pregnancy; excluded from ranking.".to_string(),
                related_product_sku: Some(product.sku.clone()),
            });
            continue;
        }
        if pregnancy == PregnancyStatus::Unknown && has_tag(product, "pregnancy_unknown") {
            warnings.push(pregnancy_unknown_warning(&product.sku));
        }

        let (score, why) = score_product(product, target, pregnancy);
        scored.push((score, product, why));
    }

    // Stable: ties keep inventory order.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let ranked = scored
        .into_iter()
        .take(TOP_K)
        .map(|(score, product, why)| RankedProduct {
            product_sku: product.sku.clone(),
            product_name: Some(product.name.clone()),
            score_0_100: score,
            why,
            evidence_refs: Vec::new(),
        })
        .collect();
    (ranked, warnings)
}

pub struct ProductRanker;

impl PipelineStep for ProductRanker {
    fn name(&self) -> StepName {
        StepName::ProductRanker
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let intake = ctx.bag.intake()?;
        let mut recommendation = ctx.bag.recommendation()?.clone();

        let (ranked, warnings) = rank_products(intake, ctx.patient, ctx.answers, ctx.products);
        let summary = format!(
            "ranked_products={} excluded_warnings={}",
            ranked.len(),
            warnings.len()
        );

        recommendation.ranked_products = ranked;
        let mut merged = std::mem::take(&mut recommendation.safety_warnings);
        merged.extend(warnings);
        recommendation.safety_warnings = dedupe_warnings(merged);

        Ok(StepOutcome::new(StepOutput::Recommendation(recommendation))
            .with_event(ctx.tool_event(self.name(), "product_ranker", summary)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Allergy, Language};
    use crate::pipeline::steps::testing::Fixture;

    fn ranked_fixture() -> Fixture {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.advance_to(StepName::ProductRanker);
        fx
    }

    fn run(fx: &Fixture) -> crate::models::Recommendation {
        match ProductRanker.run(&fx.ctx()).unwrap().output {
            StepOutput::Recommendation(reco) => reco,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn allergy_case_ranks_antihistamines_first() {
        let fx = ranked_fixture();
        let reco = run(&fx);
        let ranked: Vec<_> = reco
            .ranked_products
            .iter()
            .map(|p| (p.product_sku.as_str(), p.score_0_100))
            .collect();
        assert_eq!(
            ranked,
            vec![("SKU-ALG-001", 98), ("SKU-ALG-002", 95), ("SKU-ALG-003", 60)]
        );
        assert_eq!(
            reco.ranked_products[0].why,
            "Category match: allergy; Key ingredient match; In stock"
        );
        assert!(reco.safety_warnings.is_empty());
    }

    #[test]
    fn out_of_stock_products_are_never_ranked() {
        let fx = ranked_fixture();
        let reco = run(&fx);
        assert!(reco.ranked_products.iter().all(|p| p.product_sku != "SKU-ALG-005"));
    }

    #[test]
    fn allergy_match_excludes_with_blocker_warning() {
        let mut fx = ranked_fixture();
        fx.patient.allergies.push(Allergy {
            substance: "Cetirizine".into(),
        });
        let reco = run(&fx);
        assert!(reco.ranked_products.iter().all(|p| p.product_sku != "SKU-ALG-001"));
        let w = &reco.safety_warnings[0];
        assert_eq!(w.code, "ALLERGY_MATCH");
        assert_eq!(w.severity, Severity::Blocker);
        assert_eq!(w.related_product_sku.as_deref(), Some("SKU-ALG-001"));
    }

    #[test]
    fn unknown_pregnancy_warns_and_pregnant_excludes() {
        let mut fx = ranked_fixture();
        fx.patient.pregnancy_status = None;
        let reco = run(&fx);
        assert!(reco
            .safety_warnings
            .iter()
            .any(|w| w.code == "PREGNANCY_STATUS_UNKNOWN"
                && w.related_product_sku.as_deref() == Some("SKU-ALG-001")));
        assert!(reco.ranked_products[0].why.ends_with("Confirm pregnancy status"));

        let mut product = fx.products[0].clone();
        product.sku = "SKU-ALG-004".into();
        product.contraindication_tags = vec!["pregnancy_contraindicated".into()];
        fx.products.push(product);
        fx.patient.pregnancy_status = Some("pregnant".into());
        let reco = run(&fx);
        assert!(reco.ranked_products.iter().all(|p| p.product_sku != "SKU-ALG-004"));
        assert!(reco
            .safety_warnings
            .iter()
            .any(|w| w.code == "PREGNANCY_CONTRAINDICATED"));
    }

    #[test]
    fn pregnancy_status_resolution() {
        let mut patient = PatientContext::default();
        let none = AnswerMap::default();
        assert_eq!(pregnancy_status(&patient, &none), PregnancyStatus::Unknown);

        let yes = AnswerMap::from_answers(&[crate::models::FollowUpAnswer {
            question_id: "q_pregnancy".into(),
            answer: "yes".into(),
        }]);
        assert_eq!(pregnancy_status(&patient, &yes), PregnancyStatus::Pregnant);

        patient.demographics.sex = Some("M".into());
        assert_eq!(pregnancy_status(&patient, &yes), PregnancyStatus::NotApplicable);
    }

    #[test]
    fn category_inference() {
        let intake = |label: &str| IntakeExtracted {
            presenting_problem: String::new(),
            symptoms: vec![crate::models::Symptom {
                label: label.into(),
                severity: crate::models::SymptomSeverity::Unknown,
                duration_days: None,
            }],
            red_flags: vec![],
        };
        assert_eq!(target_category(&intake("sneezing")), "allergy");
        assert_eq!(target_category(&intake("bloating")), "digestion");
        assert_eq!(target_category(&intake("dry skin")), "dermatology");
        assert_eq!(target_category(&intake("headache")), "general");
    }
}
