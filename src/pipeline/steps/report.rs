//! Pharmacist-facing report.
//!
//! The delegated variant is only accepted when the markdown passes the PHI
//! boundary, the prescription-advice lint and the citation lint. Anything
//! else falls back to the deterministic template.

use std::collections::HashSet;

use super::{Delegation, PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{EvidenceItem, IntakeExtracted, Language, RankedProduct, Recommendation};
use crate::pipeline::lint::{lint_citations, lint_rx_advice};
use crate::pipeline::text::truncate_chars;
use crate::privacy;

const MAX_REPORT_CHARS: usize = 20_000;
const MAX_PROMPT_CHARS: usize = 7_000;

/// Neutralize raw HTML in interpolated values.
pub(crate) fn safe_text(text: &str) -> String {
    text.replace('<', "‹").replace('>', "›").trim().to_string()
}

fn product_label(p: &RankedProduct) -> String {
    match p.product_name.as_deref().map(safe_text) {
        Some(name) if !name.is_empty() => format!("{name} ({})", safe_text(&p.product_sku)),
        _ => safe_text(&p.product_sku),
    }
}

struct Labels {
    title: &'static str,
    scope: &'static str,
    note: &'static str,
    summary: &'static str,
    escalation: &'static str,
    recommendations: &'static str,
    safety: &'static str,
    evidence: &'static str,
}

fn labels(language: Language) -> Labels {
    match language {
        Language::En => Labels {
            title: "# Pharmacist report",
            scope: "OTC/parapharmacy decision support only.",
            note: "Do not change prescription treatment without medical advice.",
            summary: "## Summary",
            escalation: "## Escalation",
            recommendations: "## Recommendations",
            safety: "## Safety",
            evidence: "## Evidence",
        },
        Language::Fr => Labels {
            title: "# Rapport pharmacien",
            scope: "Aide a la decision OTC/parapharmacie uniquement.",
            note: "Ne modifiez pas votre traitement sur ordonnance sans avis medical.",
            summary: "## Synthese",
            escalation: "## Escalade",
            recommendations: "## Recommandations",
            safety: "## Securite",
            evidence: "## Sources",
        },
    }
}

/// Deterministic report. An escalated run gets the escalation-only form:
/// no product or evidence sections.
pub fn render_report(
    intake: &IntakeExtracted,
    reco: &Recommendation,
    evidence: &[EvidenceItem],
    language: Language,
) -> String {
    let l = labels(language);
    let mut lines = vec![
        l.title.to_string(),
        String::new(),
        format!("- Scope: {}", l.scope),
        format!("- Note: {}", l.note),
        String::new(),
        l.summary.to_string(),
        format!("- Presenting problem: {}", safe_text(&intake.presenting_problem)),
    ];
    if !intake.symptoms.is_empty() {
        let symptoms: Vec<String> = intake.symptoms.iter().map(|s| safe_text(&s.label)).collect();
        lines.push(format!("- Symptoms: {}", symptoms.join(", ")));
    }

    let escalated = reco.escalation_recommended();
    if let Some(esc) = reco.escalation.as_ref().filter(|e| e.recommended) {
        lines.push(String::new());
        lines.push(l.escalation.to_string());
        lines.push(format!(
            "- {}: {}",
            safe_text(&esc.suggested_service),
            safe_text(&esc.reason)
        ));
    }

    if !escalated {
        lines.push(String::new());
        lines.push(l.recommendations.to_string());
        if reco.ranked_products.is_empty() {
            lines.push("- (none)".to_string());
        }
        for p in &reco.ranked_products {
            let cite = p
                .evidence_refs
                .iter()
                .map(|r| format!("[{r}]"))
                .collect::<Vec<_>>()
                .join(" ");
            let line = format!(
                "- {} (score {}): {} {cite}",
                product_label(p),
                p.score_0_100,
                safe_text(&p.why)
            );
            lines.push(line.trim_end().to_string());
        }
    }

    lines.push(String::new());
    lines.push(l.safety.to_string());
    if reco.safety_warnings.is_empty() {
        lines.push("- (none)".to_string());
    }
    for w in &reco.safety_warnings {
        lines.push(format!(
            "- {}: {} - {}",
            w.severity,
            safe_text(&w.code),
            safe_text(&w.message)
        ));
    }

    if !escalated {
        lines.push(String::new());
        lines.push(l.evidence.to_string());
        if evidence.is_empty() {
            lines.push("- (none)".to_string());
        }
        for ev in evidence {
            lines.push(format!(
                "- [{}] {} - {} ({})",
                safe_text(&ev.evidence_id),
                safe_text(&ev.title),
                safe_text(&ev.publisher),
                safe_text(&ev.url)
            ));
        }
    }

    truncate_chars(&lines.join("\n"), MAX_REPORT_CHARS)
}

/// Structured-only prompt: no raw text ever reaches it.
fn build_prompt(
    intake: &IntakeExtracted,
    reco: &Recommendation,
    evidence: &[EvidenceItem],
    language: Language,
) -> String {
    let mut lines = vec![
        format!("Language: {language}"),
        String::new(),
        "Intake (structured):".to_string(),
        format!("- presenting_problem: {}", safe_text(&intake.presenting_problem)),
        "- symptoms:".to_string(),
    ];
    for s in &intake.symptoms {
        lines.push(format!(
            "  - {} (severity={}, duration_days={})",
            safe_text(&s.label),
            s.severity,
            s.duration_days.map(|d| d.to_string()).unwrap_or_default()
        ));
    }
    lines.push(String::new());
    lines.push("Recommendation (structured):".to_string());
    for p in &reco.ranked_products {
        lines.push(format!(
            "- product {}: score={} why={}",
            product_label(p),
            p.score_0_100,
            safe_text(&p.why)
        ));
        if !p.evidence_refs.is_empty() {
            lines.push(format!("  evidence_refs: {}", p.evidence_refs.join(", ")));
        }
    }
    lines.push(String::new());
    lines.push("Evidence (allowed citations):".to_string());
    for ev in evidence.iter().take(10) {
        lines.push(format!(
            "- [{}] {} ({})",
            safe_text(&ev.evidence_id),
            safe_text(&ev.title),
            safe_text(&ev.publisher)
        ));
        lines.push(format!("  summary: {}", safe_text(&ev.summary)));
    }
    lines.push(String::new());
    lines.push(
        "Write a concise pharmacist report in markdown with sections: \
         Summary, Recommendations, Safety, Evidence."
            .to_string(),
    );
    truncate_chars(&lines.join("\n"), MAX_PROMPT_CHARS)
}

const SYSTEM_PROMPT: &str = "You are a pharmacist-facing report writer.\n\
Return markdown only.\n\
OTC/parapharmacy decision support only.\n\
Do NOT provide prescription-medication advice.\n\
Citations MUST use the provided evidence ids in brackets, e.g. [ev_allergy_001].";

/// Which gate rejected a model report, if any.
pub fn report_gate(markdown: &str, evidence_ids: &HashSet<&str>) -> Result<(), &'static str> {
    let path = "$.artifacts.report_markdown";
    if privacy::scan_text(markdown, path).iter().any(|v| v.is_blocker()) {
        return Err("report failed PHI scan");
    }
    if lint_rx_advice(markdown, path).iter().any(|v| v.is_blocker()) {
        return Err("report contains prescription advice");
    }
    if lint_citations(markdown, evidence_ids, path).iter().any(|v| v.is_blocker()) {
        return Err("report cites unknown evidence");
    }
    Ok(())
}

pub struct ReportComposer;

impl ReportComposer {
    fn evidence<'a>(ctx: &'a StepContext<'_>) -> &'a [EvidenceItem] {
        ctx.bag.evidence.as_deref().unwrap_or_default()
    }
}

impl PipelineStep for ReportComposer {
    fn name(&self) -> StepName {
        StepName::ReportComposer
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let intake = ctx.bag.intake()?;
        let reco = ctx.bag.recommendation()?;
        let markdown = render_report(intake, reco, Self::evidence(ctx), ctx.language);
        Ok(StepOutcome::new(StepOutput::Report(markdown)))
    }

    fn delegation(&self, ctx: &StepContext<'_>) -> Option<Delegation> {
        if ctx.bag.escalated() {
            return None;
        }
        let intake = ctx.bag.intake.as_ref()?;
        let reco = ctx.bag.recommendation.as_ref()?;
        Some(Delegation {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(intake, reco, Self::evidence(ctx), ctx.language),
        })
    }

    fn accept(&self, ctx: &StepContext<'_>, raw: &str) -> Result<StepOutcome, StepError> {
        let markdown = raw.trim();
        if markdown.is_empty() {
            return Err(StepError::Rejected("empty report"));
        }
        let evidence_ids: HashSet<&str> = Self::evidence(ctx)
            .iter()
            .map(|e| e.evidence_id.as_str())
            .collect();
        report_gate(markdown, &evidence_ids).map_err(StepError::Rejected)?;
        Ok(StepOutcome::new(StepOutput::Report(truncate_chars(
            markdown,
            MAX_REPORT_CHARS,
        ))))
    }
}
