//! Pharmacist pre-brief: the few lines to read before the patient reaches
//! the counter.

use std::collections::HashSet;

use super::{PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{EventType, Language, Prebrief, Recommendation, Severity, StoredEvent};
use crate::pipeline::lint::lint_rx_advice;
use crate::pipeline::text::truncate_chars;

const MAX_ITEMS: usize = 3;
const MAX_ITEM_CHARS: usize = 240;

struct Defaults {
    action: &'static str,
    risk: &'static str,
    question: &'static str,
    changed: &'static str,
    rx_delta: &'static str,
}

fn defaults(language: Language) -> Defaults {
    match language {
        Language::En => Defaults {
            action: "Confirm symptom evolution with the patient.",
            risk: "No major risk detected.",
            question: "When did the symptoms start?",
            changed: "No notable change since last analysis.",
            rx_delta: "No critical Rx delta.",
        },
        Language::Fr => Defaults {
            action: "Confirmer l'evolution des symptomes avec le patient.",
            risk: "Aucun risque majeur detecte.",
            question: "Depuis quand les symptomes ont-ils commence?",
            changed: "Aucun changement notable depuis la derniere analyse.",
            rx_delta: "Aucun delta Rx critique.",
        },
    }
}

/// First `MAX_ITEMS` distinct non-empty lines that pass the prescription
/// lint, or the default line when none survive.
fn top_unique(items: Vec<String>, default: &str, path: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let text = truncate_chars(item.trim(), MAX_ITEM_CHARS);
        if text.is_empty() || lint_rx_advice(&text, path).iter().any(|v| v.is_blocker()) {
            continue;
        }
        if seen.insert(text.clone()) {
            out.push(text);
        }
        if out.len() == MAX_ITEMS {
            break;
        }
    }
    if out.is_empty() {
        out.push(default.to_string());
    }
    out
}

/// Deterministic pre-brief from the recommendation and the run's events so far.
pub fn compose_prebrief(
    reco: Option<&Recommendation>,
    events: &[StoredEvent],
    language: Language,
    visit_ref: Option<&str>,
) -> Prebrief {
    let mut actions = Vec::new();
    let mut risks = Vec::new();
    let mut questions = Vec::new();
    let mut changed = Vec::new();
    let mut rx_delta = Vec::new();

    if let Some(reco) = reco {
        if let Some(esc) = reco.escalation.as_ref().filter(|e| e.recommended) {
            let service = match esc.suggested_service.trim() {
                "" => "Medical review",
                s => s,
            };
            actions.push(match language {
                Language::Fr => format!("Escalade recommandee: {service}"),
                Language::En => format!("Escalation recommended: {service}"),
            });
            risks.push(esc.reason.clone());
        }
        for p in &reco.ranked_products {
            let sku = p.product_sku.trim();
            if sku.is_empty() {
                continue;
            }
            actions.push(format!("{sku}: {}", p.why.trim()));
            if !p.evidence_refs.is_empty() {
                let refs: Vec<&str> = p.evidence_refs.iter().take(2).map(String::as_str).collect();
                rx_delta.push(format!("{sku} evidence: {}", refs.join(", ")));
            }
        }
        for w in &reco.safety_warnings {
            let msg = w.message.trim();
            if msg.is_empty() {
                continue;
            }
            risks.push(format!("{}: {msg}", w.severity));
            if w.severity == Severity::Blocker {
                rx_delta.push(format!("Blocker: {msg}"));
            }
        }
        questions.extend(reco.follow_up_questions.iter().map(|q| q.question.clone()));
    }

    if let Some(visit_ref) = visit_ref {
        changed.push(match language {
            Language::Fr => format!("Nouvelle visite analysee: {visit_ref}"),
            Language::En => format!("New visit analyzed: {visit_ref}"),
        });
    }
    for stored in events {
        let ev = &stored.event;
        match ev.event_type {
            EventType::ToolResult => changed.extend(ev.result_summary.clone()),
            EventType::PolicyViolation => risks.extend(ev.message.clone()),
            _ => {}
        }
    }

    let d = defaults(language);
    let path = "$.artifacts.prebrief";
    Prebrief {
        top_actions: top_unique(actions, d.action, path),
        top_risks: top_unique(risks, d.risk, path),
        top_questions: top_unique(questions, d.question, path),
        what_changed: top_unique(changed, d.changed, path),
        new_rx_delta: top_unique(rx_delta, d.rx_delta, path),
    }
}

pub struct PrebriefComposer;

impl PipelineStep for PrebriefComposer {
    fn name(&self) -> StepName {
        StepName::Prebrief
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let events = ctx.trace.list(ctx.run_id)?;
        let prebrief = compose_prebrief(
            ctx.bag.recommendation.as_ref(),
            &events,
            ctx.language,
            ctx.visit_ref,
        );
        let summary = format!(
            "actions={} risks={}",
            prebrief.top_actions.len(),
            prebrief.top_risks.len()
        );
        Ok(StepOutcome::new(StepOutput::Prebrief(prebrief))
            .with_event(ctx.tool_event(self.name(), "prebrief_composer", summary)))
    }

    fn has_fallback(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TraceEvent;
    use crate::pipeline::steps::testing::Fixture;

    fn prebrief(fx: &Fixture) -> Prebrief {
        match PrebriefComposer.run(&fx.ctx()).unwrap().output {
            StepOutput::Prebrief(p) => p,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn completed_run_leads_with_ranked_products() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.advance_to(StepName::Prebrief);
        let p = prebrief(&fx);
        assert!(p.top_actions[0].starts_with("SKU-ALG-001: "));
        assert!(p.top_actions.len() <= MAX_ITEMS);
        assert_eq!(p.new_rx_delta[0], "SKU-ALG-001 evidence: ev_allergy_002, ev_allergy_001");
        assert_eq!(p.top_questions, vec!["When did the symptoms start?"]);
        assert_eq!(p.what_changed, vec!["No notable change since last analysis."]);
    }

    #[test]
    fn escalation_comes_first_in_french() {
        let mut fx = Fixture::for_case("case_redflag_000101", Language::Fr);
        fx.advance_to(StepName::Prebrief);
        let p = prebrief(&fx);
        assert_eq!(p.top_actions[0], "Escalade recommandee: SAMU / Urgences (15/112)");
        assert_ne!(p.top_risks[0], "Aucun risque majeur detecte.");
        assert_eq!(p.new_rx_delta, vec!["Aucun delta Rx critique."]);
    }

    #[test]
    fn what_changed_uses_visit_and_tool_summaries() {
        let mut fx = Fixture::for_case("case_000042", Language::En);
        fx.visit_ref = Some("visit_000001".into());
        for summary in ["retrieved=5", "retrieved=5", "safety_warnings_added=0"] {
            fx.hub
                .emit(
                    &fx.run_id,
                    TraceEvent::new(EventType::ToolResult)
                        .step("evidence_retrieval")
                        .tool("evidence_retrieval", summary),
                )
                .unwrap();
        }
        let p = prebrief(&fx);
        assert_eq!(
            p.what_changed,
            vec![
                "New visit analyzed: visit_000001",
                "retrieved=5",
                "safety_warnings_added=0"
            ]
        );
    }

    #[test]
    fn prescription_advice_lines_are_dropped() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.advance_to(StepName::Prebrief);
        let mut reco = fx.bag.recommendation.clone().unwrap();
        for p in reco.ranked_products.iter_mut() {
            p.why = "Stop your blood pressure medication today.".into();
        }
        reco.escalation = None;
        let p = compose_prebrief(Some(&reco), &[], Language::En, None);
        assert_eq!(p.top_actions, vec!["Confirm symptom evolution with the patient."]);
    }

    #[test]
    fn empty_inputs_yield_defaults() {
        let p = compose_prebrief(None, &[], Language::Fr, None);
        assert_eq!(p.top_actions.len(), 1);
        assert_eq!(p.top_risks, vec!["Aucun risque majeur detecte."]);
        assert_eq!(p.new_rx_delta, vec!["Aucun delta Rx critique."]);
    }
}
