use serde::{Deserialize, Serialize};

use super::enums::{EventType, Severity};

/// A policy finding. `message` describes the rule, never the matched text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub severity: Severity,
    pub json_path: String,
    pub message: String,
}

impl Violation {
    pub fn is_blocker(&self) -> bool {
        self.severity == Severity::Blocker
    }
}

/// Redacted trace event payload. Every free-text field is produced by
/// the pipeline itself (step names, counts, codes), never copied from input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_sha256_12: Option<String>,
}

impl TraceEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ts: chrono::Utc::now().to_rfc3339(),
            step: None,
            message: None,
            tool_name: None,
            result_summary: None,
            rule_id: None,
            severity: None,
            error_code: None,
            violations: Vec::new(),
            input_len: None,
            input_sha256_12: None,
        }
    }

    pub fn step(mut self, step: &str) -> Self {
        self.step = Some(step.to_string());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn tool(mut self, tool_name: &str, result_summary: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.to_string());
        self.result_summary = Some(result_summary.into());
        self
    }

    pub fn rule(mut self, rule_id: &str, severity: Severity) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self.severity = Some(severity);
        self
    }

    pub fn error_code(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }

    pub fn violations(mut self, violations: Vec<Violation>) -> Self {
        self.violations = violations;
        self
    }

    pub fn input_fingerprint(mut self, len: usize, sha256_12: String) -> Self {
        self.input_len = Some(len);
        self.input_sha256_12 = Some(sha256_12);
        self
    }
}

/// An event as persisted: the row id is the stream event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub run_id: String,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// Redacted trace artifact attached to a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceArtifact {
    pub trace_id: String,
    pub run_id: String,
    pub events: Vec<StoredEvent>,
}
