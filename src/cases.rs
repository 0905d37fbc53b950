//! Compiled-in synthetic case bundles.
//!
//! A case bundle is the whole input of a case-based run: OCR intake text in
//! both languages, the patient context and the candidate products.

use thiserror::Error;

use crate::models::CaseBundle;

static CASES: &[(&str, &str)] = &[
    (
        "case_000042",
        include_str!("../resources/cases/case_000042.json"),
    ),
    (
        "case_redflag_000101",
        include_str!("../resources/cases/case_redflag_000101.json"),
    ),
    (
        "case_lowinfo_000102",
        include_str!("../resources/cases/case_lowinfo_000102.json"),
    ),
    (
        "case_phi_000103",
        include_str!("../resources/cases/case_phi_000103.json"),
    ),
];

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Unknown case: {0}")]
    NotFound(String),

    #[error("Case bundle {case_ref} is invalid: {source}")]
    Invalid {
        case_ref: String,
        source: serde_json::Error,
    },
}

pub fn load_case_bundle(case_ref: &str) -> Result<CaseBundle, CaseError> {
    let (_, raw) = CASES
        .iter()
        .find(|(id, _)| *id == case_ref)
        .ok_or_else(|| CaseError::NotFound(case_ref.to_string()))?;
    serde_json::from_str(raw).map_err(|source| CaseError::Invalid {
        case_ref: case_ref.to_string(),
        source,
    })
}

pub fn list_case_refs() -> Vec<&'static str> {
    CASES.iter().map(|(id, _)| *id).collect()
}
