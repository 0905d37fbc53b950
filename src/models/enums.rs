use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern.
/// The string form doubles as the serde wire name.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(RunStatus {
    Created => "created",
    Running => "running",
    NeedsMoreInfo => "needs_more_info",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    /// Terminal runs are never mutated again; a rerun is a new run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NeedsMoreInfo | Self::Completed | Self::Failed)
    }
}

str_enum!(Language {
    Fr => "fr",
    En => "en",
});

str_enum!(Trigger {
    Manual => "manual",
    Import => "import",
    OcrUpload => "ocr_upload",
    ScheduledRefresh => "scheduled_refresh",
});

str_enum!(EventType {
    StepStarted => "step_started",
    StepCompleted => "step_completed",
    ToolResult => "tool_result",
    RuleFired => "rule_fired",
    PolicyViolation => "policy_violation",
    Failed => "failed",
    Finalized => "finalized",
});

impl EventType {
    /// The last event a subscriber will ever receive for a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

str_enum!(Severity {
    Blocker => "BLOCKER",
    Warn => "WARN",
});

str_enum!(SymptomSeverity {
    Mild => "mild",
    Moderate => "moderate",
    Severe => "severe",
    Unknown => "unknown",
});

str_enum!(AnswerType {
    YesNo => "yes_no",
    Number => "number",
    Text => "text",
    Choice => "choice",
});

str_enum!(StepMode {
    Deterministic => "deterministic",
    Delegated => "delegated",
    Fallback => "fallback",
});

str_enum!(PlanStepKind {
    CounselingQuestion => "counseling_question",
    SafetyCheck => "safety_check",
    OtcSuggestion => "otc_suggestion",
    Escalation => "escalation",
    EvidenceReview => "evidence_review",
});

str_enum!(PlanMode {
    Agentic => "agentic",
    Deterministic => "deterministic",
});

str_enum!(AnalysisStatus {
    UpToDate => "up_to_date",
    RefreshPending => "refresh_pending",
    Running => "running",
    Failed => "failed",
});

impl AnalysisStatus {
    /// Statuses that put a patient in the pharmacist inbox.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::UpToDate)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::UpToDate => "Analysis is up to date.",
            Self::RefreshPending => "New data detected; refresh is pending.",
            Self::Running => "Refresh is running.",
            Self::Failed => "Last refresh failed. Manual refresh recommended.",
        }
    }
}

str_enum!(PrimaryDomain {
    AllergyEnt => "allergy_ent",
    Digestive => "digestive",
    Skin => "skin",
    Eye => "eye",
    Urology => "urology",
    Pain => "pain",
    Respiratory => "respiratory",
    Other => "other",
});

impl PrimaryDomain {
    pub const ALL: [PrimaryDomain; 8] = [
        Self::AllergyEnt,
        Self::Digestive,
        Self::Skin,
        Self::Eye,
        Self::Urology,
        Self::Pain,
        Self::Respiratory,
        Self::Other,
    ];
}

str_enum!(AuditOutcome {
    Allowed => "allowed",
    Unauthorized => "unauthorized",
    RateLimited => "rate_limited",
    ValidationFailed => "validation_failed",
    NotFound => "not_found",
    Error => "error",
});

impl AuditOutcome {
    /// Outcome implied by a finished admin response.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Allowed,
            401 | 403 => Self::Unauthorized,
            429 => Self::RateLimited,
            404 => Self::NotFound,
            400..=499 => Self::ValidationFailed,
            _ => Self::Error,
        }
    }
}
