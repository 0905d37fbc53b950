//! Offline evidence retrieval over the compiled-in corpus.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::ranker::target_category;
use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{EvidenceItem, IntakeExtracted, PatientContext};

const TOP_K: usize = 5;
const REFS_PER_PRODUCT: usize = 2;
const MAX_QUERY_CHARS: usize = 500;

static CORPUS: LazyLock<Vec<EvidenceItem>> = LazyLock::new(|| {
    serde_json::from_str(include_str!("../../../resources/evidence/corpus.json"))
        .expect("Invalid evidence corpus")
});

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]{3,}").expect("Invalid token regex"));

pub fn corpus() -> &'static [EvidenceItem] {
    &CORPUS
}

fn tokens(text: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn build_query(intake: &IntakeExtracted, patient: &PatientContext) -> String {
    let mut parts = vec![intake.presenting_problem.as_str()];
    parts.extend(intake.symptoms.iter().map(|s| s.label.as_str()));
    parts.extend(patient.conditions.iter().map(|c| c.label.as_str()));
    parts.join(" ").chars().take(MAX_QUERY_CHARS).collect()
}

fn publisher_bonus(publisher: &str) -> usize {
    let p = publisher.to_uppercase();
    [("HAS", 3), ("NHS", 2), ("CDC", 2), ("WHO", 1)]
        .iter()
        .filter(|(name, _)| p.contains(name))
        .map(|(_, bonus)| bonus)
        .sum()
}

/// Keyword overlap plus publisher and category bonus, top `k`.
pub fn retrieve_evidence(
    intake: &IntakeExtracted,
    patient: &PatientContext,
    k: usize,
) -> Vec<EvidenceItem> {
    let query = tokens(&build_query(intake, patient));
    let category = target_category(intake);
    let category_prefix = format!("ev_{category}");

    let mut scored: Vec<(usize, &EvidenceItem)> = corpus()
        .iter()
        .map(|item| {
            let text = tokens(&format!("{} {}", item.title, item.summary));
            let overlap = query.intersection(&text).count();
            let mut bonus = publisher_bonus(&item.publisher);
            if category != "general" && item.evidence_id.starts_with(&category_prefix) {
                bonus += 3;
            }
            (overlap + bonus, item)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(k.max(1))
        .map(|(_, item)| item.clone())
        .collect()
}

pub struct EvidenceRetrieval;

impl PipelineStep for EvidenceRetrieval {
    fn name(&self) -> StepName {
        StepName::EvidenceRetrieval
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let intake = ctx.bag.intake()?;
        let mut recommendation = ctx.bag.recommendation()?.clone();

        let items = retrieve_evidence(intake, ctx.patient, TOP_K);
        let refs: Vec<String> = items
            .iter()
            .take(REFS_PER_PRODUCT)
            .map(|e| e.evidence_id.clone())
            .collect();
        for product in &mut recommendation.ranked_products {
            product.evidence_refs = refs.clone();
        }

        let summary = format!("retrieved={}", items.len());
        Ok(StepOutcome::new(StepOutput::Evidence {
            items,
            recommendation,
        })
        .with_event(ctx.tool_event(self.name(), "evidence_retrieval", summary)))
    }
}
