//! Text normalization shared by the deterministic steps.
//!
//! Every rule that matches on intake wording goes through `normalize` so
//! accents, OCR punctuation noise and casing never change an outcome.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

static DISALLOWED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9\s:/().,-]+").expect("Invalid normalize regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

/// Strip accents (NFKD), lowercase, keep a small ASCII alphabet and
/// collapse whitespace.
pub fn normalize(text: &str) -> String {
    let lowered = strip_accents(text).to_lowercase();
    let cleaned = DISALLOWED_RE.replace_all(&lowered, " ");
    WHITESPACE_RE.replace_all(&cleaned, " ").trim().to_string()
}

/// NFKD decomposition with combining marks removed. Case is preserved.
pub fn strip_accents(text: &str) -> String {
    text.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// `normalize` without any spaces, robust to OCR spacing breaks.
pub fn compact(text: &str) -> String {
    normalize(text).replace(' ', "")
}

/// Undo common OCR digit-for-letter substitutions.
pub fn deleet(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '0' => 'o',
            '1' => 'i',
            '2' => 'z',
            '3' => 'e',
            '4' => 'a',
            '5' => 's',
            '6' | '9' => 'g',
            '7' => 't',
            '8' => 'b',
            other => other,
        })
        .collect()
}

/// Map a compacted label to one of the canonical symptom labels.
pub fn canonical_label(compact_norm: &str) -> Option<&'static str> {
    let has = |needle: &str| compact_norm.contains(needle);
    if has("sneez") || has("eternu") {
        return Some("sneezing");
    }
    if (has("itchy") && has("eye")) || (has("gratt") && (has("yeux") || has("oeil"))) {
        return Some("itchy eyes");
    }
    if has("dryskin") || has("peausech") {
        return Some("dry skin");
    }
    if has("bloat") || has("ballonn") {
        return Some("bloating");
    }
    None
}

/// Canonicalize a raw label: de-leet first, then the plain compact form,
/// else keep the label with whitespace collapsed.
pub fn canonicalize_label(raw: &str) -> String {
    let compact_norm = compact(raw);
    canonical_label(&deleet(&compact_norm))
        .or_else(|| canonical_label(&compact_norm))
        .map(String::from)
        .unwrap_or_else(|| WHITESPACE_RE.replace_all(raw.trim(), " ").to_string())
}

/// Lenient yes detection for follow-up answers.
pub fn is_yes(answer: Option<&str>) -> bool {
    let Some(raw) = answer else {
        return false;
    };
    let v = raw.trim().to_lowercase();
    matches!(v.as_str(), "yes" | "y" | "oui" | "o" | "true" | "1")
        || v.starts_with("yes ")
        || v.starts_with("oui ")
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_accents_and_noise() {
        assert_eq!(normalize("  Éternuements !!  (modéré) "), "eternuements (modere)");
        assert_eq!(normalize("Gêne\trespiratoire"), "gene respiratoire");
    }

    #[test]
    fn compact_removes_spaces() {
        assert_eq!(compact("Dry  Skin"), "dryskin");
    }

    #[test]
    fn deleet_recovers_letters() {
        assert_eq!(deleet("3y35"), "eyes");
        assert_eq!(deleet("5n33zing"), "sneezing");
    }

    #[test]
    fn canonical_labels() {
        assert_eq!(canonicalize_label("Sneezing"), "sneezing");
        assert_eq!(canonicalize_label("Yeux qui grattent"), "itchy eyes");
        assert_eq!(canonicalize_label("itchy 3y35"), "itchy eyes");
        assert_eq!(canonicalize_label("Peau sèche"), "dry skin");
        assert_eq!(canonicalize_label("Ballonnements"), "bloating");
        assert_eq!(canonicalize_label("  Chest   pain "), "Chest pain");
    }

    #[test]
    fn yes_detection() {
        assert!(is_yes(Some("Oui")));
        assert!(!is_yes(Some("yes, since yesterday")));
        assert!(is_yes(Some("yes since yesterday")));
        assert!(!is_yes(Some("no")));
        assert!(!is_yes(None));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("épée", 2), "ép");
    }
}
