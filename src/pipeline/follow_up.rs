//! Closed follow-up question bank and answer handling.
//!
//! Question ids are compiled in. Nothing at runtime (rules, model-assisted
//! selection, client input) can introduce an id outside `QUESTION_BANK`.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::models::{AnswerType, FollowUpAnswer, FollowUpQuestion, Language};

/// Upper bound on questions attached to a `needs_more_info` run.
pub const MAX_FOLLOW_UP_QUESTIONS: usize = 5;

pub const PRIMARY_DOMAIN_CHOICES: &[&str] = &[
    "allergy_ent",
    "digestive",
    "skin",
    "eye",
    "urology",
    "pain",
    "respiratory",
    "other",
];

pub const SEVERITY_CHOICES: &[&str] = &["mild", "moderate", "severe"];

/// One entry of the compiled-in bank.
pub struct QuestionSpec {
    pub id: &'static str,
    pub priority: u8,
    pub answer_type: AnswerType,
    pub choices: &'static [&'static str],
    pub range: Option<(f64, f64)>,
    prompt_fr: &'static str,
    prompt_en: &'static str,
    reason_fr: &'static str,
    reason_en: &'static str,
}

impl QuestionSpec {
    /// Materialize the question in the run language.
    pub fn to_question(&self, language: Language) -> FollowUpQuestion {
        let (question, reason) = match language {
            Language::Fr => (self.prompt_fr, self.reason_fr),
            Language::En => (self.prompt_en, self.reason_en),
        };
        FollowUpQuestion {
            question_id: self.id.to_string(),
            question: question.to_string(),
            answer_type: self.answer_type,
            choices: self.choices.iter().map(|c| c.to_string()).collect(),
            reason: reason.to_string(),
            priority: self.priority,
        }
    }
}

pub static QUESTION_BANK: &[QuestionSpec] = &[
    QuestionSpec {
        id: "q_primary_domain",
        priority: 1,
        answer_type: AnswerType::Choice,
        choices: PRIMARY_DOMAIN_CHOICES,
        range: None,
        prompt_fr: "Quel est le domaine principal de la plainte ?",
        prompt_en: "What is the main area of the complaint?",
        reason_fr: "Le domaine oriente les questions et les produits pertinents.",
        reason_en: "The main area drives which questions and products are relevant.",
    },
    QuestionSpec {
        id: "q_duration",
        priority: 1,
        answer_type: AnswerType::Number,
        choices: &[],
        range: Some((0.0, 3650.0)),
        prompt_fr: "Depuis combien de jours ?",
        prompt_en: "For how many days?",
        reason_fr: "La duree aide a differencier une situation benigne d'un probleme a evaluer.",
        reason_en: "Duration helps distinguish self-limited issues from those needing evaluation.",
    },
    QuestionSpec {
        id: "q_breathing",
        priority: 1,
        answer_type: AnswerType::YesNo,
        choices: &[],
        range: None,
        prompt_fr: "Avez-vous une gene respiratoire ?",
        prompt_en: "Any difficulty breathing?",
        reason_fr: "Une gene respiratoire est un signe d'alerte.",
        reason_en: "Breathing difficulty is a red flag.",
    },
    QuestionSpec {
        id: "q_chest_pain",
        priority: 1,
        answer_type: AnswerType::YesNo,
        choices: &[],
        range: None,
        prompt_fr: "Avez-vous une douleur thoracique ?",
        prompt_en: "Any chest pain?",
        reason_fr: "La douleur thoracique est un signe d'alerte.",
        reason_en: "Chest pain is a red flag.",
    },
    QuestionSpec {
        id: "q_fever",
        priority: 2,
        answer_type: AnswerType::YesNo,
        choices: &[],
        range: None,
        prompt_fr: "Avez-vous de la fievre ?",
        prompt_en: "Do you have a fever?",
        reason_fr: "La fievre peut orienter vers une infection ou une evaluation medicale.",
        reason_en: "Fever may indicate infection or the need for medical evaluation.",
    },
    QuestionSpec {
        id: "q_temperature",
        priority: 2,
        answer_type: AnswerType::Number,
        choices: &[],
        range: Some((30.0, 45.0)),
        prompt_fr: "Temperature maximale (°C) ?",
        prompt_en: "Max temperature (°C)?",
        reason_fr: "Une temperature elevee (>= 39°C) est un signe d'alerte.",
        reason_en: "High temperature (>= 39°C) is a red flag.",
    },
    QuestionSpec {
        id: "q_overall_severity",
        priority: 3,
        answer_type: AnswerType::Choice,
        choices: SEVERITY_CHOICES,
        range: None,
        prompt_fr: "Quelle est l'intensite globale des symptomes ?",
        prompt_en: "How severe are the symptoms overall?",
        reason_fr: "L'intensite aide a decider entre conseil officinal et orientation.",
        reason_en: "Severity helps decide between pharmacy advice and referral.",
    },
    QuestionSpec {
        id: "q_pregnancy",
        priority: 3,
        answer_type: AnswerType::YesNo,
        choices: &[],
        range: None,
        prompt_fr: "Etes-vous enceinte ?",
        prompt_en: "Are you pregnant?",
        reason_fr: "Certains produits necessitent des precautions en cas de grossesse.",
        reason_en: "Some products require caution in pregnancy.",
    },
];

pub fn question_spec(id: &str) -> Option<&'static QuestionSpec> {
    QUESTION_BANK.iter().find(|q| q.id == id)
}

/// Dedupe, drop answered ids, sort by (priority, id), cap.
pub fn finalize_question_ids<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    answers: &AnswerMap,
) -> Vec<&'static QuestionSpec> {
    let mut specs: Vec<&'static QuestionSpec> = Vec::new();
    for id in candidates {
        if answers.contains(id) {
            continue;
        }
        if let Some(spec) = question_spec(id) {
            if !specs.iter().any(|s| s.id == spec.id) {
                specs.push(spec);
            }
        }
    }
    specs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(b.id)));
    specs.truncate(MAX_FOLLOW_UP_QUESTIONS);
    specs
}

// ═══════════════════════════════════════════════════════════
// Answers
// ═══════════════════════════════════════════════════════════

/// Validated answers keyed by question id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerMap(BTreeMap<String, String>);

impl AnswerMap {
    pub fn from_answers(answers: &[FollowUpAnswer]) -> Self {
        Self(
            answers
                .iter()
                .map(|a| (a.question_id.trim().to_string(), a.answer.trim().to_string()))
                .filter(|(q, a)| !q.is_empty() && !a.is_empty())
                .collect(),
        )
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.0.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn number(&self, id: &str) -> Option<f64> {
        self.get(id)?.replace(',', ".").parse::<f64>().ok()
    }
}

/// One problem with a submitted answer. Never echoes the submitted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerIssue {
    pub code: &'static str,
    pub json_path: String,
    pub message: &'static str,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid follow-up answers: {}", codes(.issues))]
pub struct FollowUpError {
    pub issues: Vec<AnswerIssue>,
}

fn codes(issues: &[AnswerIssue]) -> String {
    issues.iter().map(|i| i.code).collect::<Vec<_>>().join(", ")
}

fn canonical_yes_no(answer: &str) -> Option<&'static str> {
    match answer.to_lowercase().as_str() {
        "yes" | "y" | "oui" | "o" | "true" | "1" => Some("yes"),
        "no" | "n" | "non" | "false" | "0" => Some("no"),
        _ => None,
    }
}

/// Validate every answer against the bank and return canonical forms.
///
/// All issues are collected; any issue rejects the whole list.
pub fn validate_answers(answers: &[FollowUpAnswer]) -> Result<Vec<FollowUpAnswer>, FollowUpError> {
    let mut canonical = Vec::with_capacity(answers.len());
    let mut issues = Vec::new();

    for (idx, item) in answers.iter().enumerate() {
        let issue = |code, field: &str, message| AnswerIssue {
            code,
            json_path: format!("$.follow_up_answers[{idx}].{field}"),
            message,
        };

        let qid = item.question_id.trim();
        let answer = item.answer.trim();
        if qid.is_empty() {
            issues.push(issue("MISSING_QUESTION_ID", "question_id", "question_id must be a non-empty string."));
            continue;
        }
        if answer.is_empty() {
            issues.push(issue("MISSING_ANSWER", "answer", "answer must be a non-empty string."));
            continue;
        }
        let Some(spec) = question_spec(qid) else {
            issues.push(issue("UNKNOWN_QUESTION_ID", "question_id", "question_id is not in the question bank."));
            continue;
        };

        let value = match spec.answer_type {
            AnswerType::YesNo => match canonical_yes_no(answer) {
                Some(v) => v.to_string(),
                None => {
                    issues.push(issue("INVALID_YES_NO", "answer", "Expected a yes/no answer (yes/no, oui/non)."));
                    continue;
                }
            },
            AnswerType::Choice => {
                if !spec.choices.contains(&answer) {
                    issues.push(issue("INVALID_CHOICE", "answer", "Answer must be one of the listed choices."));
                    continue;
                }
                answer.to_string()
            }
            AnswerType::Number => {
                let normalized = answer.replace(',', ".");
                let Ok(number) = normalized.parse::<f64>() else {
                    issues.push(issue("INVALID_NUMBER", "answer", "Expected a numeric answer."));
                    continue;
                };
                if let Some((min, max)) = spec.range {
                    if !(min..=max).contains(&number) {
                        issues.push(issue("NUMBER_OUT_OF_RANGE", "answer", "Number is outside the accepted range."));
                        continue;
                    }
                }
                normalized
            }
            AnswerType::Text => answer.to_string(),
        };

        canonical.push(FollowUpAnswer {
            question_id: qid.to_string(),
            answer: value,
        });
    }

    if issues.is_empty() {
        Ok(canonical)
    } else {
        Err(FollowUpError { issues })
    }
}

/// Later answers override earlier ones by id; output sorted by id.
pub fn merge_answers(prior: &[FollowUpAnswer], new: &[FollowUpAnswer]) -> Vec<FollowUpAnswer> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for a in prior.iter().chain(new) {
        let qid = a.question_id.trim();
        let answer = a.answer.trim();
        if qid.is_empty() || answer.is_empty() {
            continue;
        }
        merged.insert(qid.to_string(), answer.to_string());
    }
    merged
        .into_iter()
        .map(|(question_id, answer)| FollowUpAnswer {
            question_id,
            answer,
        })
        .collect()
}
