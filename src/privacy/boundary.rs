//! Hard boundary for untrusted free text (OCR intake, uploaded documents,
//! follow-up answers). Text that trips a BLOCKER here must not reach a
//! model, a persisted artifact, or a trace event.

use std::sync::LazyLock;

use regex::Regex;

use super::scanner::scan_str;
use super::PhiBoundaryError;
use crate::models::{Severity, Violation};

/// Identifier field labels, only when followed by a colon.
static PHI_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(nom|pr[eé]nom|adresse|email|mail|t[eé]l[eé]phone|telephone|nir|ssn)\s*:")
        .expect("Invalid PHI label regex")
});

pub fn scan_text(text: &str, json_path: &str) -> Vec<Violation> {
    let mut violations = scan_str(text, json_path);
    if PHI_LABEL_RE.is_match(text) {
        violations.push(Violation {
            code: "PHI_LABEL".to_string(),
            severity: Severity::Blocker,
            json_path: json_path.to_string(),
            message: "Identifier-like field label detected in untrusted text.".to_string(),
        });
    }
    violations
}

/// Fail with the BLOCKER subset when any is present.
pub fn raise_if_phi(text: &str, json_path: &str) -> Result<(), PhiBoundaryError> {
    let blockers: Vec<Violation> = scan_text(text, json_path)
        .into_iter()
        .filter(Violation::is_blocker)
        .collect();
    if blockers.is_empty() {
        Ok(())
    } else {
        Err(PhiBoundaryError { violations: blockers })
    }
}
