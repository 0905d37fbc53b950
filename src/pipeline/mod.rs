//! Intake-to-report pipeline: step registry, executor, run orchestration
//! and the per-run event hub.

pub mod executor;
pub mod follow_up;
pub mod lint;
pub mod model_client;
pub mod orchestrator;
pub mod refresh;
pub mod steps;
pub mod text;
pub mod trace;
