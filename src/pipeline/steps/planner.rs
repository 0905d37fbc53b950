//! Counter plan: an ordered list of typed steps for the pharmacist.
//!
//! The delegated variant asks the model for strict JSON and keeps the plan
//! only when every step has an allowlisted kind and the whole plan passes
//! the PHI boundary and the prescription-advice lint. Anything else falls
//! back to the plan derived from the recommendation.

use serde::Deserialize;
use serde_json::Value;

use super::{Delegation, PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{Language, PlanMode, PlanStep, PlanStepKind, PlannerPlan, Recommendation};
use crate::pipeline::lint::lint_rx_advice;
use crate::pipeline::model_client::parse_first_json_object;
use crate::pipeline::text::truncate_chars;
use crate::privacy;

pub const PLANNER_VERSION: &str = "v1";

const MAX_STEPS: usize = 8;
const MAX_TITLE_CHARS: usize = 120;
const MAX_DETAIL_CHARS: usize = 600;
const MAX_REFS: usize = 4;
const MAX_CHECKS: usize = 6;
const MAX_PROMPT_CHARS: usize = 5_000;

const FALLBACK_CHECKS: [&str; 3] = [
    "No PHI in plan artifact.",
    "Closed allowlist for step kinds.",
    "No prescription-medication advice.",
];

fn plan_step(id: String, kind: PlanStepKind, title: String, detail: String) -> PlanStep {
    PlanStep {
        step_id: id,
        kind,
        title,
        detail,
        evidence_refs: Vec::new(),
    }
}

/// Deterministic plan: safety checks, escalation, OTC options, then
/// counseling questions.
pub fn fallback_plan(reco: Option<&Recommendation>, language: Language) -> PlannerPlan {
    let en = language == Language::En;
    let mut steps: Vec<PlanStep> = Vec::new();

    if let Some(reco) = reco {
        for w in &reco.safety_warnings {
            let message = w.message.trim();
            if message.is_empty() {
                continue;
            }
            steps.push(plan_step(
                format!("safety-{}", steps.len() + 1),
                PlanStepKind::SafetyCheck,
                if en { "Safety check" } else { "Verification securite" }.to_string(),
                message.to_string(),
            ));
        }

        if let Some(esc) = reco.escalation.as_ref().filter(|e| e.recommended) {
            let detail = match esc.reason.trim() {
                "" => "Escalation recommended",
                reason => reason,
            };
            steps.push(plan_step(
                format!("escalation-{}", steps.len() + 1),
                PlanStepKind::Escalation,
                if en { "Escalate" } else { "Escalade" }.to_string(),
                detail.to_string(),
            ));
        }

        for p in &reco.ranked_products {
            let sku = p.product_sku.trim();
            if sku.is_empty() {
                continue;
            }
            let label = match p.product_name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => format!("{name} ({sku})"),
                _ => sku.to_string(),
            };
            let detail = match p.why.trim() {
                "" if en => "Check suitability before dispensing",
                "" => "Verifier avant delivrance",
                why => why,
            };
            let mut step = plan_step(
                format!("otc-{}", steps.len() + 1),
                PlanStepKind::OtcSuggestion,
                truncate_chars(&format!("OTC {label}"), MAX_TITLE_CHARS),
                detail.to_string(),
            );
            step.evidence_refs = p.evidence_refs.iter().take(2).cloned().collect();
            steps.push(step);
            if steps.len() >= 5 {
                break;
            }
        }

        for q in &reco.follow_up_questions {
            let text = q.question.trim();
            if text.is_empty() {
                continue;
            }
            steps.push(plan_step(
                format!("question-{}", steps.len() + 1),
                PlanStepKind::CounselingQuestion,
                if en { "Ask patient" } else { "Question patient" }.to_string(),
                text.to_string(),
            ));
            if steps.len() >= 6 {
                break;
            }
        }
    }

    if steps.is_empty() {
        steps.push(plan_step(
            "fallback-1".to_string(),
            PlanStepKind::CounselingQuestion,
            if en { "Clarify symptoms" } else { "Clarifier les symptomes" }.to_string(),
            if en {
                "Collect symptom chronology and blockers before OTC advice."
            } else {
                "Recueillir la chronologie des symptomes avant conseil OTC."
            }
            .to_string(),
        ));
    }
    steps.truncate(MAX_STEPS);

    PlannerPlan {
        planner_version: PLANNER_VERSION.to_string(),
        mode: PlanMode::Deterministic,
        safety_checks: FALLBACK_CHECKS.iter().map(|c| c.to_string()).collect(),
        steps,
    }
}

/// Recommendation summary only: the model never sees intake text.
fn build_prompt(reco: &Recommendation, language: Language) -> String {
    let mut lines = vec![
        "Return STRICT JSON only.".to_string(),
        "Allowed step kinds: counseling_question, safety_check, otc_suggestion, escalation, \
         evidence_review."
            .to_string(),
        "Output object with keys: safety_checks (array[string]), steps (array[object] with \
         kind, title, detail, evidence_refs)."
            .to_string(),
        format!("Language: {language}"),
        "Context summary:".to_string(),
    ];
    if let Some(esc) = reco.escalation.as_ref().filter(|e| e.recommended) {
        lines.push(format!("- escalation: {}", esc.reason));
    }
    for w in &reco.safety_warnings {
        lines.push(format!("- warning: {} {}", w.severity, w.message));
    }
    for p in &reco.ranked_products {
        lines.push(format!(
            "- product: {} why={} refs={}",
            p.product_sku,
            p.why,
            p.evidence_refs.join(",")
        ));
    }
    truncate_chars(&lines.join("\n"), MAX_PROMPT_CHARS)
}

const SYSTEM_PROMPT: &str =
    "You are a strict pharmacy planner. Return JSON only, with no markdown fences or prose.";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Candidate {
    #[serde(default)]
    safety_checks: Option<Vec<Value>>,
    steps: Vec<CandidateStep>,
}

#[derive(Deserialize)]
struct CandidateStep {
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    evidence_refs: Vec<Value>,
}

/// `counseling_question` -> `Counseling Question`.
fn kind_title(kind: PlanStepKind) -> String {
    kind.as_str()
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn normalize_step(step: CandidateStep, idx: usize) -> Option<PlanStep> {
    let kind: PlanStepKind = step.kind.trim().parse().ok()?;
    let detail = step.detail.as_deref().map(str::trim).unwrap_or_default();
    if detail.is_empty() {
        return None;
    }
    let title = match step.title.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => kind_title(kind),
    };
    Some(PlanStep {
        step_id: format!("agentic-{}", idx + 1),
        kind,
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        detail: truncate_chars(detail, MAX_DETAIL_CHARS),
        evidence_refs: step
            .evidence_refs
            .iter()
            .filter_map(Value::as_str)
            .take(MAX_REFS)
            .map(str::to_string)
            .collect(),
    })
}

/// Coerce a model answer into a plan. Any invalid step rejects the whole
/// answer.
pub fn coerce_plan(raw: &str) -> Result<PlannerPlan, &'static str> {
    let value = parse_first_json_object(raw).ok_or("no JSON object")?;
    let candidate: Candidate =
        serde_json::from_value(value).map_err(|_| "plan shape mismatch")?;

    let mut steps = Vec::new();
    for (idx, step) in candidate.steps.into_iter().take(MAX_STEPS).enumerate() {
        steps.push(normalize_step(step, idx).ok_or("plan step invalid")?);
    }
    if steps.is_empty() {
        return Err("plan has no steps");
    }

    let mut safety_checks: Vec<String> = candidate
        .safety_checks
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .take(MAX_CHECKS)
        .map(|c| truncate_chars(c.trim(), MAX_DETAIL_CHARS))
        .collect();
    if safety_checks.is_empty() {
        safety_checks = FALLBACK_CHECKS[..2].iter().map(|c| c.to_string()).collect();
    }

    let plan = PlannerPlan {
        planner_version: PLANNER_VERSION.to_string(),
        mode: PlanMode::Agentic,
        safety_checks,
        steps,
    };

    let path = "$.artifacts.plan";
    if privacy::scan_artifact(&plan, path).iter().any(|v| v.is_blocker()) {
        return Err("plan failed PHI scan");
    }
    let texts = plan
        .steps
        .iter()
        .flat_map(|s| [s.title.as_str(), s.detail.as_str()])
        .chain(plan.safety_checks.iter().map(String::as_str));
    for text in texts {
        if lint_rx_advice(text, path).iter().any(|v| v.is_blocker()) {
            return Err("plan contains prescription advice");
        }
    }
    Ok(plan)
}

pub struct Planner;

impl PipelineStep for Planner {
    fn name(&self) -> StepName {
        StepName::Planner
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let plan = fallback_plan(ctx.bag.recommendation.as_ref(), ctx.language);
        let summary = format!("mode={} steps={}", plan.mode, plan.steps.len());
        Ok(StepOutcome::new(StepOutput::Plan(plan))
            .with_event(ctx.tool_event(self.name(), "planner", summary)))
    }

    fn delegation(&self, ctx: &StepContext<'_>) -> Option<Delegation> {
        let reco = ctx.bag.recommendation.as_ref()?;
        Some(Delegation {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(reco, ctx.language),
        })
    }

    fn accept(&self, ctx: &StepContext<'_>, raw: &str) -> Result<StepOutcome, StepError> {
        let plan = coerce_plan(raw).map_err(StepError::Rejected)?;
        let summary = format!("mode={} steps={}", plan.mode, plan.steps.len());
        Ok(StepOutcome::new(StepOutput::Plan(plan))
            .with_event(ctx.tool_event(self.name(), "planner", summary)))
    }
}
