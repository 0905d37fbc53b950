//! Output lints for composed markdown: prescription-medication advice and
//! evidence citations.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::text::strip_accents;
use crate::models::{Severity, Violation};

/// Safe disclaimers ("do not change your prescription without advice").
/// Removed before the block patterns run so a disclaimer cannot mask advice
/// elsewhere in the text.
static ALLOWLIST_FR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ne|n')\s*(modifi(?:ez|er)|arret(?:ez|er)|stoppez|stopper|chang(?:ez|er)|augment(?:ez|er)|diminu(?:ez|er)).{0,60}\b(traitement|posologie|dose|ordonnance)\b.{0,60}\b(sans avis|sans l'avis)\b",
    )
    .expect("Invalid rx allowlist regex")
});

static ALLOWLIST_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bdo\s+not\b.{0,30}\b(change|stop|increase|decrease)\b.{0,60}\b(prescription|medication|dose)\b",
    )
    .expect("Invalid rx allowlist regex")
});

static BLOCK_FR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(arret(?:ez|er)|stoppez|stopper|modifi(?:ez|er)|augment(?:ez|er)|diminu(?:ez|er)|chang(?:ez|er))\b.{0,60}\b(traitement|posologie|dose|ordonnance|antibiotique|corticoide|anticoagulant|insuline|antidepresseur|chimiotherapie)\b",
    )
    .expect("Invalid rx block regex")
});

static BLOCK_EN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(stop|discontinue|change|increase|decrease)\b.{0,60}\b(prescription|medication|dose)\b")
        .expect("Invalid rx block regex")
});

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(ev_[a-z0-9_]+)\]").expect("Invalid citation regex"));

/// Flag text that reads as advice to start, stop or change a prescription.
pub fn lint_rx_advice(text: &str, path: &str) -> Vec<Violation> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let normalized = strip_accents(&text.replace(['\u{2019}', '\u{2018}'], "'"));
    let without_fr = ALLOWLIST_FR_RE.replace_all(&normalized, " ");
    let residual = ALLOWLIST_EN_RE.replace_all(&without_fr, " ");

    if BLOCK_FR_RE.is_match(&residual) || BLOCK_EN_RE.is_match(&residual) {
        return vec![Violation {
            code: "RX_ADVICE".to_string(),
            severity: Severity::Blocker,
            json_path: path.to_string(),
            message: "Potential prescription-medication advice detected (start/stop/change)."
                .to_string(),
        }];
    }
    Vec::new()
}

/// Every `[ev_...]` citation must name a retrieved evidence item.
pub fn lint_citations(markdown: &str, evidence_ids: &HashSet<&str>, path: &str) -> Vec<Violation> {
    let unknown = CITATION_RE
        .captures_iter(markdown)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|id| !evidence_ids.contains(id))
        .collect::<HashSet<_>>()
        .len();
    if unknown == 0 {
        return Vec::new();
    }
    vec![Violation {
        code: "CITATION_UNKNOWN".to_string(),
        severity: Severity::Blocker,
        json_path: path.to_string(),
        message: format!("{unknown} citation(s) do not reference retrieved evidence."),
    }]
}
