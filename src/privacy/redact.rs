//! Best-effort redaction of extracted document text before scanning.

use std::sync::LazyLock;

use regex::Regex;

use super::scanner::{EMAIL_RE, NIR_RE, PHONE_FR_RE};

static LABEL_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)\b(nom|prenom|name|first[\s-]*name|last[\s-]*name|surname|date\s*de\s*naissance|date\s*of\s*birth|dob|adresse|address|telephone|phone|email|mail)\s*:\s*([^\n\r]+)",
    )
    .expect("Invalid label-value regex")
});

/// Redacted text plus the number of replacements made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub text: String,
    pub replacements: usize,
}

pub fn redact_phi_text(text: &str) -> Redaction {
    let mut replacements = LABEL_VALUE_RE.find_iter(text).count();
    let out = LABEL_VALUE_RE.replace_all(text, "$1: [REDACTED]");

    replacements += EMAIL_RE.find_iter(&out).count();
    let out = EMAIL_RE.replace_all(&out, "[REDACTED_EMAIL]");

    replacements += PHONE_FR_RE.find_iter(&out).count();
    let out = PHONE_FR_RE.replace_all(&out, "[REDACTED_PHONE]");

    replacements += NIR_RE.find_iter(&out).count();
    let out = NIR_RE.replace_all(&out, "[REDACTED_NIR]");

    Redaction {
        text: out.into_owned(),
        replacements,
    }
}
