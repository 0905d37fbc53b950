use serde::{Deserialize, Serialize};

use super::enums::Language;

/// De-identified patient context. Only structured, coded fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub allergies: Vec<Allergy>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub current_medications: Vec<Medication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pregnancy_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_years: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allergy {
    pub substance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
}

/// OTC / parapharmacy product from the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub brand: String,
    pub category: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub contraindication_tags: Vec<String>,
    pub in_stock: bool,
    #[serde(default)]
    pub stock_qty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_eur: Option<f64>,
}

/// Per-language intake text of a synthetic case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntakeText {
    #[serde(default)]
    pub fr: String,
    #[serde(default)]
    pub en: String,
}

impl IntakeText {
    pub fn for_language(&self, language: Language) -> &str {
        match language {
            Language::Fr => &self.fr,
            Language::En => &self.en,
        }
    }
}

/// Everything a run needs once its reference is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseBundle {
    #[serde(default)]
    pub intake_text_ocr: IntakeText,
    #[serde(default)]
    pub llm_context: PatientContext,
    #[serde(default)]
    pub products: Vec<Product>,
}

/// Visit record from the synthetic pharmacy dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_ref: String,
    pub patient_ref: String,
    pub occurred_at: String,
    pub primary_domain: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_extracted: Option<super::intake::IntakeExtracted>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_ref: String,
    pub created_at: String,
    pub llm_context: PatientContext,
}

impl PatientContext {
    pub fn is_male(&self) -> bool {
        self.demographics
            .sex
            .as_deref()
            .is_some_and(|s| s.trim().to_uppercase().starts_with('M'))
    }

    pub fn is_female(&self) -> bool {
        self.demographics.sex.as_deref() == Some("F")
    }

    pub fn allergy_terms(&self) -> Vec<String> {
        self.allergies
            .iter()
            .map(|a| a.substance.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_context_parses_partial_json() {
        let ctx: PatientContext = serde_json::from_str(
            r#"{"demographics": {"sex": "F"}, "allergies": [{"substance": "Cetirizine"}]}"#,
        )
        .unwrap();
        assert!(ctx.is_female());
        assert!(!ctx.is_male());
        assert_eq!(ctx.allergy_terms(), vec!["cetirizine".to_string()]);
        assert!(ctx.conditions.is_empty());
    }

    #[test]
    fn intake_text_selects_language() {
        let text = IntakeText {
            fr: "bonjour".into(),
            en: "hello".into(),
        };
        assert_eq!(text.for_language(Language::Fr), "bonjour");
        assert_eq!(text.for_language(Language::En), "hello");
    }
}
