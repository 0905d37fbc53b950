use serde::{Deserialize, Serialize};

use super::enums::{AnswerType, Severity, SymptomSeverity};

/// Structured intake produced by the extraction step. Never carries raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeExtracted {
    pub presenting_problem: String,
    #[serde(default)]
    pub symptoms: Vec<Symptom>,
    #[serde(default)]
    pub red_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symptom {
    pub label: String,
    pub severity: SymptomSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
}

impl IntakeExtracted {
    pub fn unspecified(language: super::enums::Language) -> Self {
        let problem = match language {
            super::enums::Language::Fr => "Symptomes non specifie(s)",
            super::enums::Language::En => "Unspecified symptoms",
        };
        Self {
            presenting_problem: problem.to_string(),
            symptoms: vec![Symptom {
                label: "unspecified symptom".to_string(),
                severity: SymptomSeverity::Unknown,
                duration_days: None,
            }],
            red_flags: Vec::new(),
        }
    }

    /// Symptom labels joined into one lowercase blob.
    pub fn label_blob(&self) -> String {
        let mut blob = self
            .symptoms
            .iter()
            .map(|s| s.label.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        blob.push(' ');
        blob.push_str(&self.presenting_problem.to_lowercase());
        blob
    }
}

// ═══════════════════════════════════════════════════════════
// Recommendation
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(default)]
    pub ranked_products: Vec<RankedProduct>,
    #[serde(default)]
    pub safety_warnings: Vec<SafetyWarning>,
    #[serde(default)]
    pub follow_up_questions: Vec<FollowUpQuestion>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
}

impl Recommendation {
    pub fn escalation_recommended(&self) -> bool {
        self.escalation.as_ref().is_some_and(|e| e.recommended)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedProduct {
    pub product_sku: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    pub score_0_100: u8,
    pub why: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_product_sku: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub recommended: bool,
    pub reason: String,
    pub suggested_service: String,
}

/// A question drawn from the compiled-in bank. `question_id` is never
/// synthesized at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub question_id: String,
    pub question: String,
    pub answer_type: AnswerType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    pub reason: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub title: String,
    pub publisher: String,
    pub url: String,
    pub summary: String,
}

/// Stable dedupe of safety warnings by `(code, related_product_sku)`.
pub fn dedupe_warnings(warnings: Vec<SafetyWarning>) -> Vec<SafetyWarning> {
    let mut seen = std::collections::HashSet::new();
    warnings
        .into_iter()
        .filter(|w| seen.insert((w.code.clone(), w.related_product_sku.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning(code: &str, sku: Option<&str>) -> SafetyWarning {
        SafetyWarning {
            code: code.into(),
            severity: Severity::Warn,
            message: "m".into(),
            related_product_sku: sku.map(String::from),
        }
    }

    #[test]
    fn dedupe_keeps_first_per_code_and_sku() {
        let out = dedupe_warnings(vec![
            warning("ALLERGY_MATCH", Some("SKU-1")),
            warning("ALLERGY_MATCH", Some("SKU-1")),
            warning("ALLERGY_MATCH", Some("SKU-2")),
            warning("ESCALATION_RECOMMENDED", None),
            warning("ESCALATION_RECOMMENDED", None),
        ]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].related_product_sku.as_deref(), Some("SKU-2"));
    }

    #[test]
    fn symptom_omits_missing_duration() {
        let s = Symptom {
            label: "sneezing".into(),
            severity: SymptomSeverity::Mild,
            duration_days: None,
        };
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("duration_days").is_none());
        assert_eq!(json["severity"], "mild");
    }

    #[test]
    fn escalation_flag() {
        let mut reco = Recommendation {
            ranked_products: vec![],
            safety_warnings: vec![],
            follow_up_questions: vec![],
            confidence: 0.2,
            escalation: None,
        };
        assert!(!reco.escalation_recommended());
        reco.escalation = Some(Escalation {
            recommended: true,
            reason: "r".into(),
            suggested_service: "s".into(),
        });
        assert!(reco.escalation_recommended());
    }
}
