//! Structural PHI scanner for JSON-shaped artifacts.
//!
//! Walks objects and arrays, flags identifier-like keys and scans every
//! string leaf for identifier-shaped tokens. Findings carry a JSON path
//! (`$.a.b[0]`) and a fixed description; the matched text is never echoed.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::models::{Severity, Violation};

/// Object keys that name a direct identifier.
const FORBIDDEN_KEYS: &[&str] = &[
    "surname",
    "first_name",
    "last_name",
    "full_name",
    "patient_name",
    "patient_first_name",
    "patient_last_name",
    "email",
    "phone",
    "address",
    "street",
    "city",
    "postal_code",
    "zip",
    "dob",
    "date_of_birth",
    "nir",
    "ssn",
    "nom",
    "prenom",
    "adresse",
    "telephone",
    "téléphone",
    "mail",
    "code_postal",
    "ville",
    "date_naissance",
];

/// A compiled text pattern with its violation metadata.
struct PhiPattern {
    regex: Regex,
    code: &'static str,
    severity: Severity,
    description: &'static str,
}

fn pattern(
    regex: &str,
    code: &'static str,
    severity: Severity,
    description: &'static str,
) -> PhiPattern {
    PhiPattern {
        regex: Regex::new(regex).expect("Invalid PHI regex"),
        code,
        severity,
        description,
    }
}

pub(crate) static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").expect("Invalid email regex")
});

pub(crate) static PHONE_FR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\+33|0)[1-9](?:[ .-]?\d{2}){4}\b").expect("Invalid phone regex")
});

pub(crate) static NIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[12]\s?\d{2}\s?(?:0[1-9]|1[0-2])\s?\d{2}\s?\d{3}\s?\d{3}\s?\d{2}\b")
        .expect("Invalid NIR regex")
});

static TEXT_PATTERNS: LazyLock<Vec<PhiPattern>> = LazyLock::new(|| {
    vec![
        PhiPattern {
            regex: (*EMAIL_RE).clone(),
            code: "PHI_EMAIL",
            severity: Severity::Blocker,
            description: "Email-like pattern detected in text.",
        },
        PhiPattern {
            regex: (*PHONE_FR_RE).clone(),
            code: "PHI_PHONE_FR",
            severity: Severity::Blocker,
            description: "French phone-like pattern detected in text.",
        },
        PhiPattern {
            regex: (*NIR_RE).clone(),
            code: "PHI_NIR",
            severity: Severity::Blocker,
            description: "NIR-like pattern detected in text.",
        },
        pattern(
            r"^\d{5}$",
            "PHI_POSTAL_CODE",
            Severity::Warn,
            "Standalone 5-digit postal code detected.",
        ),
    ]
});

/// Scan any JSON value. `path` is the JSON path of `value` itself.
pub fn scan_value(value: &Value, path: &str) -> Vec<Violation> {
    let mut out = Vec::new();
    walk(value, path, &mut out);
    out
}

/// Scan a serializable artifact rooted at `path`.
pub fn scan_artifact<T: serde::Serialize>(artifact: &T, path: &str) -> Vec<Violation> {
    match serde_json::to_value(artifact) {
        Ok(value) => scan_value(&value, path),
        Err(_) => vec![Violation {
            code: "PHI_UNSCANNABLE".to_string(),
            severity: Severity::Blocker,
            json_path: path.to_string(),
            message: "Artifact could not be serialized for scanning.".to_string(),
        }],
    }
}

fn walk(value: &Value, path: &str, out: &mut Vec<Violation>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{path}.{key}");
                if FORBIDDEN_KEYS.contains(&key.to_lowercase().as_str()) {
                    out.push(Violation {
                        code: "PHI_KEY".to_string(),
                        severity: Severity::Blocker,
                        json_path: child_path.clone(),
                        message: "Forbidden identifier-like key detected.".to_string(),
                    });
                }
                walk(child, &child_path, out);
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                walk(item, &format!("{path}[{idx}]"), out);
            }
        }
        Value::String(text) => out.extend(scan_str(text, path)),
        _ => {}
    }
}

/// Scan one string leaf for identifier-shaped tokens.
pub fn scan_str(text: &str, path: &str) -> Vec<Violation> {
    let trimmed = text.trim();
    TEXT_PATTERNS
        .iter()
        .filter(|p| {
            if p.code == "PHI_POSTAL_CODE" {
                p.regex.is_match(trimmed)
            } else {
                p.regex.is_match(text)
            }
        })
        .map(|p| Violation {
            code: p.code.to_string(),
            severity: p.severity,
            json_path: path.to_string(),
            message: p.description.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codes(v: &[Violation]) -> Vec<&str> {
        v.iter().map(|x| x.code.as_str()).collect()
    }

    #[test]
    fn clean_payload_has_no_violations() {
        let v = scan_value(
            &json!({"symptoms": [{"label": "sneezing", "severity": "mild"}]}),
            "$",
        );
        assert!(v.is_empty());
    }

    #[test]
    fn forbidden_key_is_blocker_with_path() {
        let v = scan_value(&json!({"patient": {"Email": "x"}}), "$");
        assert_eq!(codes(&v), vec!["PHI_KEY"]);
        assert_eq!(v[0].json_path, "$.patient.Email");
        assert!(v[0].is_blocker());
    }

    #[test]
    fn email_phone_nir_detected_in_nested_strings() {
        let v = scan_value(
            &json!({"notes": ["contact jane.doe@example.com", "06 12 34 56 78", "1 85 05 78 006 084 36"]}),
            "$",
        );
        assert_eq!(codes(&v), vec!["PHI_EMAIL", "PHI_PHONE_FR", "PHI_NIR"]);
        assert_eq!(v[1].json_path, "$.notes[1]");
    }

    #[test]
    fn message_never_echoes_match() {
        let v = scan_str("write to jane.doe@example.com", "$.x");
        assert_eq!(v.len(), 1);
        assert!(!v[0].message.contains("jane"));
    }

    #[test]
    fn standalone_postal_code_is_warn() {
        let v = scan_str(" 75011 ", "$.zip_like");
        assert_eq!(codes(&v), vec!["PHI_POSTAL_CODE"]);
        assert_eq!(v[0].severity, Severity::Warn);
        assert!(scan_str("lot 75011 batch", "$").is_empty());
    }

    #[test]
    fn dotted_phone_detected() {
        assert_eq!(codes(&scan_str("tel 06.11.22.33.44", "$")), vec!["PHI_PHONE_FR"]);
    }

    #[test]
    fn scan_artifact_serializes_struct() {
        #[derive(serde::Serialize)]
        struct Probe {
            note: String,
        }
        let v = scan_artifact(
            &Probe {
                note: "a@b.fr".into(),
            },
            "$.artifacts.probe",
        );
        assert_eq!(v[0].json_path, "$.artifacts.probe.note");
    }
}
