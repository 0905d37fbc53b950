use serde::{Deserialize, Serialize};

use super::enums::{PlanMode, PlanStepKind};

/// Pharmacist pre-brief: up to three short lines per heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prebrief {
    pub top_actions: Vec<String>,
    pub top_risks: Vec<String>,
    pub top_questions: Vec<String>,
    pub what_changed: Vec<String>,
    pub new_rx_delta: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub kind: PlanStepKind,
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// Ordered counter plan for the pharmacist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerPlan {
    pub planner_version: String,
    pub mode: PlanMode,
    pub safety_checks: Vec<String>,
    pub steps: Vec<PlanStep>,
}
