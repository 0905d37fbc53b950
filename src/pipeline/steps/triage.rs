//! Triage: red flags, escalation, follow-up questions and confidence.
//!
//! Red flags come from the extracted intake and from explicit answers. Any
//! red flag suppresses questions. The optional delegated variant only picks
//! a subset of the rule-computed candidate question ids.

use std::collections::BTreeSet;

use serde::Deserialize;

use super::intake::canonicalize_intake;
use super::{Delegation, PipelineStep, StepContext, StepError, StepName, StepOutcome, StepOutput};
use crate::models::{
    EventType, Escalation, IntakeExtracted, Language, Recommendation, SafetyWarning, Severity,
    SymptomSeverity, TraceEvent,
};
use crate::pipeline::follow_up::{
    finalize_question_ids, question_spec, QuestionSpec, MAX_FOLLOW_UP_QUESTIONS,
};
use crate::pipeline::model_client::parse_first_json_object;
use crate::pipeline::text::{is_yes, normalize};

const HIGH_FEVER_C: f64 = 39.0;

static RED_FLAG_RULES: &[(&str, &[&str])] = &[
    (
        "RF_BREATHING_DIFFICULTY",
        &[
            "shortness of breath",
            "difficulty breathing",
            "breathing difficulty",
            "dyspnee",
            "dyspne",
            "gene respiratoire",
            "essouff",
        ],
    ),
    ("RF_CHEST_PAIN", &["chest pain", "douleur thorac", "oppression thorac"]),
    (
        "RF_ANAPHYLAXIS",
        &[
            "angioedema",
            "angioedeme",
            "oedeme de quincke",
            "swelling lips",
            "swelling face",
            "lip swelling",
            "face swelling",
            "tongue swelling",
        ],
    ),
    (
        "RF_NEURO",
        &["confusion", "seizure", "convulsion", "weakness one side", "paralys", "faiblesse"],
    ),
    (
        "RF_BLOOD",
        &[
            "blood in stool",
            "blood in vomit",
            "vomiting blood",
            "sang dans les selles",
            "sang dans les vomis",
            "sang dans vom",
            "hematemesis",
            "melena",
        ],
    ),
];

/// Canonical symptom label for an answered primary domain.
fn domain_label(domain: &str) -> Option<&'static str> {
    match domain {
        "allergy_ent" => Some("sneezing"),
        "digestive" => Some("bloating"),
        "skin" => Some("dry skin"),
        "eye" => Some("itchy eyes"),
        "urology" => Some("urinary discomfort"),
        "pain" => Some("pain"),
        "respiratory" => Some("cough"),
        _ => None,
    }
}

pub fn is_low_info(intake: &IntakeExtracted) -> bool {
    intake.symptoms.is_empty()
        || intake
            .symptoms
            .iter()
            .any(|s| s.label.to_lowercase().contains("unspecified"))
}

fn is_allergy_like(intake: &IntakeExtracted) -> bool {
    let labels = intake
        .symptoms
        .iter()
        .map(|s| normalize(&s.label))
        .collect::<Vec<_>>()
        .join(" ");
    labels.contains("sneez")
        || (labels.contains("itchy") && labels.contains("eye"))
        || labels.contains("eternu")
}

/// Apply answers that complete the intake itself.
fn apply_intake_answers(
    mut intake: IntakeExtracted,
    ctx: &StepContext<'_>,
) -> IntakeExtracted {
    let answers = ctx.answers;

    if let Some(label) = answers.get("q_primary_domain").and_then(domain_label) {
        if is_low_info(&intake) {
            intake
                .symptoms
                .retain(|s| !s.label.to_lowercase().contains("unspecified"));
            if !intake.symptoms.iter().any(|s| s.label == label) {
                intake.symptoms.push(crate::models::Symptom {
                    label: label.to_string(),
                    severity: SymptomSeverity::Unknown,
                    duration_days: None,
                });
            }
            intake = canonicalize_intake(intake, ctx.language);
        }
    }

    if let Some(days) = answers.number("q_duration").filter(|d| (0.0..=3650.0).contains(d)) {
        let days = days.round() as u32;
        for s in intake.symptoms.iter_mut().filter(|s| s.duration_days.is_none()) {
            s.duration_days = Some(days);
        }
    }

    let severity = match answers.get("q_overall_severity") {
        Some("mild") => Some(SymptomSeverity::Mild),
        Some("moderate") => Some(SymptomSeverity::Moderate),
        Some("severe") => Some(SymptomSeverity::Severe),
        _ => None,
    };
    if let Some(severity) = severity {
        for s in intake
            .symptoms
            .iter_mut()
            .filter(|s| s.severity == SymptomSeverity::Unknown)
        {
            s.severity = severity;
        }
    }
    intake
}

fn detect_red_flags(intake: &IntakeExtracted, ctx: &StepContext<'_>) -> BTreeSet<&'static str> {
    let mut blob = normalize(&intake.presenting_problem);
    for s in &intake.symptoms {
        blob.push(' ');
        blob.push_str(&normalize(&s.label));
    }

    let mut flags: BTreeSet<&'static str> = RED_FLAG_RULES
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| blob.contains(n)))
        .map(|(flag, _)| *flag)
        .collect();

    if is_yes(ctx.answers.get("q_breathing")) {
        flags.insert("RF_BREATHING_DIFFICULTY");
    }
    if is_yes(ctx.answers.get("q_chest_pain")) {
        flags.insert("RF_CHEST_PAIN");
    }
    let temperature = ctx
        .answers
        .number("q_temperature")
        .filter(|t| (30.0..=45.0).contains(t));
    if temperature.is_some_and(|t| t >= HIGH_FEVER_C) {
        flags.insert("RF_HIGH_FEVER");
    }
    flags
}

fn escalation_for(flags: &BTreeSet<&'static str>, language: Language) -> Option<Escalation> {
    if flags.is_empty() {
        return None;
    }
    let urgent = flags.contains("RF_ANAPHYLAXIS")
        || (flags.contains("RF_BREATHING_DIFFICULTY") && flags.contains("RF_CHEST_PAIN"));
    let (reason, service) = match (urgent, language) {
        (true, Language::Fr) => (
            "Signes d'alerte: appelez le SAMU / Urgences (15/112).",
            "SAMU / Urgences (15/112)",
        ),
        (true, Language::En) => (
            "Red flags detected: call emergency services (112/911 equivalent).",
            "Emergency services",
        ),
        (false, Language::Fr) => (
            "Signes d'alerte: consultez un medecin sous 24h (ou urgences si aggravation).",
            "Medecin (24h) / Urgences si aggravation",
        ),
        (false, Language::En) => (
            "Red flags detected: see a doctor within 24h (ER if worsening).",
            "Doctor (24h) / ER if worsening",
        ),
    };
    Some(Escalation {
        recommended: true,
        reason: reason.to_string(),
        suggested_service: service.to_string(),
    })
}

/// Candidate question ids from the selection rules, before capping.
///
/// An answered primary domain closes the low-info funnel, `other` included,
/// so questions capped out of the first round are not asked again.
fn candidate_ids(intake: &IntakeExtracted, ctx: &StepContext<'_>) -> Vec<&'static str> {
    let mut ids = Vec::new();
    if is_low_info(intake) && !ctx.answers.contains("q_primary_domain") {
        ids.extend([
            "q_primary_domain",
            "q_overall_severity",
            "q_fever",
            "q_breathing",
            "q_chest_pain",
        ]);
    } else if is_allergy_like(intake) {
        ids.extend(["q_fever", "q_breathing"]);
    }
    if !intake.symptoms.iter().any(|s| s.duration_days.is_some()) {
        ids.push("q_duration");
    }
    if ctx.patient.is_female() && ctx.patient.pregnancy_status.is_none() {
        ids.push("q_pregnancy");
    }
    if is_yes(ctx.answers.get("q_fever")) && !ctx.answers.contains("q_temperature") {
        ids.push("q_temperature");
    }
    ids.retain(|id| !ctx.answers.contains(id));
    ids
}

/// Everything triage decides before question selection.
struct Assessment {
    intake: IntakeExtracted,
    red_flags: BTreeSet<&'static str>,
    escalation: Option<Escalation>,
    candidates: Vec<&'static str>,
}

impl Assessment {
    fn new(ctx: &StepContext<'_>) -> Result<Self, StepError> {
        let intake = apply_intake_answers(ctx.bag.intake()?.clone(), ctx);
        let red_flags = detect_red_flags(&intake, ctx);
        let escalation = escalation_for(&red_flags, ctx.language);
        let candidates = if red_flags.is_empty() {
            candidate_ids(&intake, ctx)
        } else {
            Vec::new()
        };
        Ok(Self {
            intake,
            red_flags,
            escalation,
            candidates,
        })
    }

    fn into_outcome(
        self,
        ctx: &StepContext<'_>,
        questions: Vec<&'static QuestionSpec>,
        selector_summary: String,
    ) -> StepOutcome {
        let mut intake = self.intake;
        intake.red_flags = self.red_flags.iter().map(|f| f.to_string()).collect();

        let confidence = if is_low_info(&intake) {
            0.1
        } else if self.red_flags.is_empty() && questions.is_empty() {
            0.5
        } else {
            0.2
        };

        let safety_warnings = self
            .escalation
            .iter()
            .map(|e| SafetyWarning {
                code: "ESCALATION_RECOMMENDED".to_string(),
                severity: Severity::Warn,
                message: e.reason.clone(),
                related_product_sku: None,
            })
            .collect();

        let recommendation = Recommendation {
            ranked_products: Vec::new(),
            safety_warnings,
            follow_up_questions: questions.iter().map(|q| q.to_question(ctx.language)).collect(),
            confidence,
            escalation: self.escalation,
        };

        let mut outcome = StepOutcome::new(StepOutput::Triage {
            intake,
            recommendation,
        });
        for flag in &self.red_flags {
            outcome = outcome.with_event(
                TraceEvent::new(EventType::RuleFired)
                    .step(StepName::Triage.as_str())
                    .rule(flag, Severity::Warn)
                    .message(format!("Red flag detected: {flag}")),
            );
        }
        if !questions.is_empty() {
            outcome = outcome.with_event(
                TraceEvent::new(EventType::RuleFired)
                    .step(StepName::Triage.as_str())
                    .rule("FOLLOW_UP_REQUIRED", Severity::Warn)
                    .message(format!("Follow-up required ({} questions).", questions.len())),
            );
        }
        if !self.candidates.is_empty() {
            outcome =
                outcome.with_event(ctx.tool_event(StepName::Triage, "followup_selector", selector_summary));
        }
        outcome
    }
}

fn ids_summary(mode: &str, questions: &[&'static QuestionSpec]) -> String {
    let ids: Vec<_> = questions.iter().map(|q| q.id).collect();
    format!("mode={mode} selected={} ids={}", ids.len(), ids.join(","))
}

#[derive(Deserialize)]
struct SelectorOutput {
    #[serde(default)]
    question_ids: Vec<serde_json::Value>,
}

const SELECTOR_SYSTEM: &str = "You are a clinical follow-up question selector.\n\
Output MUST be a single JSON object and nothing else.";

pub struct Triage;

impl PipelineStep for Triage {
    fn name(&self) -> StepName {
        StepName::Triage
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, StepError> {
        let assessment = Assessment::new(ctx)?;
        let questions = finalize_question_ids(assessment.candidates.iter().copied(), ctx.answers);
        let summary = ids_summary("rules", &questions);
        Ok(assessment.into_outcome(ctx, questions, summary))
    }

    fn delegation(&self, ctx: &StepContext<'_>) -> Option<Delegation> {
        let assessment = Assessment::new(ctx).ok()?;
        if assessment.candidates.is_empty() {
            return None;
        }

        let allowlist = assessment
            .candidates
            .iter()
            .filter_map(|id| question_spec(id))
            .map(|q| {
                let en = q.to_question(Language::En).question;
                format!("- {} ({}): {}", q.id, q.answer_type, en)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let symptoms = assessment
            .intake
            .symptoms
            .iter()
            .map(|s| s.label.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let demographics = &ctx.patient.demographics;

        let prompt = format!(
            "Select the most relevant follow-up question ids from the allowlist below.\n\
             Return ONLY a JSON object with key question_ids: array of ids from the allowlist.\n\
             Language: {}\nMax ids: {MAX_FOLLOW_UP_QUESTIONS}\nDo NOT invent new ids.\n\n\
             Symptoms: {symptoms}\nDemographics: age_years={} sex={}\n\nALLOWLIST:\n{allowlist}\n",
            ctx.language,
            demographics
                .age_years
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".into()),
            demographics.sex.as_deref().unwrap_or("unknown"),
        );
        Some(Delegation {
            system: SELECTOR_SYSTEM.to_string(),
            prompt,
        })
    }

    fn accept(&self, ctx: &StepContext<'_>, raw: &str) -> Result<StepOutcome, StepError> {
        let assessment = Assessment::new(ctx)?;
        let value = parse_first_json_object(raw).ok_or(StepError::Rejected("no JSON object"))?;
        let parsed: SelectorOutput = serde_json::from_value(value)
            .map_err(|_| StepError::Rejected("selector shape mismatch"))?;

        let mut selected: Vec<&'static str> = Vec::new();
        for id in parsed.question_ids.iter().filter_map(|v| v.as_str()) {
            let id = id.trim();
            if let Some(allowed) = assessment.candidates.iter().find(|c| **c == id) {
                if !selected.contains(allowed) {
                    selected.push(*allowed);
                }
            }
            if selected.len() >= MAX_FOLLOW_UP_QUESTIONS {
                break;
            }
        }
        if selected.is_empty() {
            return Err(StepError::Rejected("no allowlisted question ids selected"));
        }

        let questions = finalize_question_ids(selected, ctx.answers);
        let summary = ids_summary("model", &questions);
        Ok(assessment.into_outcome(ctx, questions, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::steps::testing::Fixture;

    fn triage(fx: &mut Fixture) -> (IntakeExtracted, Recommendation, Vec<TraceEvent>) {
        fx.advance_to(StepName::Triage);
        let outcome = Triage.run(&fx.ctx()).unwrap();
        let StepOutput::Triage {
            intake,
            recommendation,
        } = outcome.output
        else {
            panic!("expected triage output");
        };
        (intake, recommendation, outcome.events)
    }

    fn ids(reco: &Recommendation) -> Vec<&str> {
        reco.follow_up_questions
            .iter()
            .map(|q| q.question_id.as_str())
            .collect()
    }

    #[test]
    fn allergy_case_asks_fever_and_breathing() {
        let mut fx = Fixture::for_case("case_000042", Language::En);
        let (_, reco, events) = triage(&mut fx);
        assert_eq!(ids(&reco), vec!["q_breathing", "q_fever"]);
        assert!((reco.confidence - 0.2).abs() < f32::EPSILON);
        assert!(events
            .iter()
            .any(|e| e.rule_id.as_deref() == Some("FOLLOW_UP_REQUIRED")));
    }

    #[test]
    fn answered_allergy_case_is_complete() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        let (_, reco, _) = triage(&mut fx);
        assert!(reco.follow_up_questions.is_empty());
        assert!(reco.escalation.is_none());
        assert!((reco.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn fever_yes_asks_temperature_and_high_fever_escalates() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "yes"), ("q_breathing", "no")]);
        let (_, reco, _) = triage(&mut fx);
        assert_eq!(ids(&reco), vec!["q_temperature"]);

        let mut fx = Fixture::for_case("case_000042", Language::En).with_answers(&[
            ("q_fever", "yes"),
            ("q_breathing", "no"),
            ("q_temperature", "39.4"),
        ]);
        let (intake, reco, _) = triage(&mut fx);
        assert_eq!(intake.red_flags, vec!["RF_HIGH_FEVER"]);
        assert!(reco.escalation_recommended());
        assert!(reco.follow_up_questions.is_empty());
        assert_eq!(
            reco.escalation.unwrap().suggested_service,
            "Doctor (24h) / ER if worsening"
        );
    }

    #[test]
    fn breathing_and_chest_pain_escalate_urgently() {
        let mut fx = Fixture::for_case("case_redflag_000101", Language::En);
        let (intake, reco, events) = triage(&mut fx);
        assert_eq!(intake.red_flags, vec!["RF_BREATHING_DIFFICULTY", "RF_CHEST_PAIN"]);
        let escalation = reco.escalation.clone().unwrap();
        assert_eq!(escalation.suggested_service, "Emergency services");
        assert_eq!(reco.safety_warnings[0].code, "ESCALATION_RECOMMENDED");
        assert!(reco.follow_up_questions.is_empty());
        let fired: Vec<_> = events.iter().filter_map(|e| e.rule_id.as_deref()).collect();
        assert_eq!(fired, vec!["RF_BREATHING_DIFFICULTY", "RF_CHEST_PAIN"]);
    }

    #[test]
    fn french_red_flags_use_french_escalation() {
        let mut fx = Fixture::for_case("case_redflag_000101", Language::Fr);
        let (_, reco, _) = triage(&mut fx);
        assert_eq!(
            reco.escalation.unwrap().suggested_service,
            "SAMU / Urgences (15/112)"
        );
    }

    #[test]
    fn low_info_asks_primary_domain_then_resolves() {
        let mut fx = Fixture::for_case("case_lowinfo_000102", Language::En);
        let (_, reco, _) = triage(&mut fx);
        let asked = ids(&reco);
        assert!(asked.contains(&"q_primary_domain"));
        assert_eq!(asked.len(), MAX_FOLLOW_UP_QUESTIONS);
        assert!((reco.confidence - 0.1).abs() < f32::EPSILON);

        let answers: Vec<(&str, &str)> = vec![
            ("q_breathing", "no"),
            ("q_chest_pain", "no"),
            ("q_duration", "4"),
            ("q_primary_domain", "digestive"),
            ("q_fever", "no"),
        ];
        let mut fx = Fixture::for_case("case_lowinfo_000102", Language::En).with_answers(&answers);
        let (intake, reco, _) = triage(&mut fx);
        assert!(reco.follow_up_questions.is_empty());
        assert_eq!(intake.symptoms[0].label, "bloating");
        assert_eq!(intake.symptoms[0].duration_days, Some(4));
        assert_eq!(intake.presenting_problem, "Bloating after meals");
    }

    #[test]
    fn low_info_with_other_domain_asks_nothing_more() {
        let answers: Vec<(&str, &str)> = vec![
            ("q_breathing", "no"),
            ("q_chest_pain", "no"),
            ("q_duration", "3"),
            ("q_primary_domain", "other"),
            ("q_fever", "no"),
        ];
        let mut fx = Fixture::for_case("case_lowinfo_000102", Language::En).with_answers(&answers);
        let (intake, reco, _) = triage(&mut fx);
        assert!(ids(&reco).is_empty());
        assert!(is_low_info(&intake));
        assert!((reco.confidence - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn pregnancy_question_for_unknown_status() {
        let mut fx = Fixture::for_case("case_000042", Language::En)
            .with_answers(&[("q_fever", "no"), ("q_breathing", "no")]);
        fx.patient.pregnancy_status = None;
        let (_, reco, _) = triage(&mut fx);
        assert_eq!(ids(&reco), vec!["q_pregnancy"]);
    }

    #[test]
    fn selector_output_is_intersected_with_candidates() {
        let mut fx = Fixture::for_case("case_lowinfo_000102", Language::En);
        fx.advance_to(StepName::Triage);
        let delegation = Triage.delegation(&fx.ctx()).unwrap();
        assert!(delegation.prompt.contains("q_primary_domain"));

        let raw = r#"{"question_ids": ["q_primary_domain", "q_invented", "q_primary_domain", 7, "q_fever"]}"#;
        let outcome = Triage.accept(&fx.ctx(), raw).unwrap();
        let StepOutput::Triage { recommendation, .. } = outcome.output else {
            panic!("expected triage output");
        };
        assert_eq!(ids(&recommendation), vec!["q_primary_domain", "q_fever"]);

        assert!(Triage
            .accept(&fx.ctx(), r#"{"question_ids": ["q_invented"]}"#)
            .is_err());
    }

    #[test]
    fn no_delegation_without_candidates() {
        let mut fx = Fixture::for_case("case_redflag_000101", Language::En);
        fx.advance_to(StepName::Triage);
        assert!(Triage.delegation(&fx.ctx()).is_none());
    }
}
