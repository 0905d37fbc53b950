//! Transport-agnostic application state.
//!
//! `CoreState` is built once at startup, wrapped in `Arc` and shared by the
//! HTTP layer and every spawned run. It owns no connection: handlers and
//! steps open one per operation through `open_db()`.

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::db::{self, SeedReport};
use crate::ingest::pdf::{LopdfExtractor, PdfTextExtractor};
use crate::pipeline::executor::StepExecutor;
use crate::pipeline::model_client::{ModelClient, ModelError, OllamaModelClient};
use crate::pipeline::refresh::RefreshQueue;
use crate::pipeline::trace::TraceHub;

// ═══════════════════════════════════════════════════════════
// CoreState
// ═══════════════════════════════════════════════════════════

pub struct CoreState {
    config: AppConfig,
    trace: TraceHub,
    executor: StepExecutor,
    pdf: Arc<dyn PdfTextExtractor>,
    refresh: RefreshQueue,
    started_at: Instant,
}

impl CoreState {
    /// Deterministic state: no model boundary, lopdf text extraction.
    pub fn new(config: AppConfig) -> Self {
        let trace = TraceHub::new(config.db_path.clone());
        Self {
            config,
            trace,
            executor: StepExecutor::deterministic(),
            pdf: Arc::new(LopdfExtractor),
            refresh: RefreshQueue::default(),
            started_at: Instant::now(),
        }
    }

    /// State as configured: a model client when `PHARMASSIST_MODEL_URL`
    /// is set, deterministic steps otherwise.
    pub fn from_config(config: AppConfig) -> Result<Self, CoreError> {
        let model = match config.model.url.as_deref() {
            Some(url) => {
                let client = OllamaModelClient::new(url, &config.model.model, config.model.timeout)?;
                tracing::info!(model = %config.model.model, "Model boundary enabled");
                Some(Arc::new(client) as Arc<dyn ModelClient>)
            }
            None => {
                tracing::info!("No model configured, all steps deterministic");
                None
            }
        };
        let timeout = config.model.timeout;
        let state = Self::new(config);
        Ok(match model {
            Some(client) => state.with_executor(StepExecutor::with_model(client, timeout)),
            None => state,
        })
    }

    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_pdf_extractor(mut self, pdf: Arc<dyn PdfTextExtractor>) -> Self {
        self.pdf = pdf;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn trace(&self) -> &TraceHub {
        &self.trace
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn pdf(&self) -> Arc<dyn PdfTextExtractor> {
        Arc::clone(&self.pdf)
    }

    pub fn refresh(&self) -> &RefreshQueue {
        &self.refresh
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Open a fresh connection to the application database.
    pub fn open_db(&self) -> Result<rusqlite::Connection, CoreError> {
        db::open_database(&self.config.db_path).map_err(CoreError::Database)
    }

    /// Run migrations and load the demo dataset into empty tables.
    pub fn initialize(&self) -> Result<SeedReport, CoreError> {
        let conn = self.open_db()?;
        let report = db::seed_demo_dataset(&conn)?;
        tracing::info!(
            seeded = report.loaded,
            patients = report.patients,
            inventory = report.inventory,
            "Database ready"
        );
        Ok(report)
    }
}

/// Errors from CoreState operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Internal lock error")]
    LockPoisoned,
    #[error("Database error: {0}")]
    Database(#[from] db::DatabaseError),
    #[error("Model client error: {0}")]
    Model(#[from] ModelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(dir: &tempfile::TempDir, extra: &[(&str, &str)]) -> AppConfig {
        let mut env: HashMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert(
            "PHARMASSIST_DB_PATH".into(),
            dir.path().join("core.db").display().to_string(),
        );
        AppConfig::from_lookup(|k| env.get(k).cloned()).unwrap()
    }

    #[test]
    fn initialize_seeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let core = CoreState::new(config(&dir, &[]));
        let first = core.initialize().unwrap();
        assert!(first.loaded);
        assert!(first.patients > 0);
        let second = core.initialize().unwrap();
        assert!(!second.loaded);
        assert_eq!(second.patients, first.patients);
        assert!(core.open_db().is_ok());
    }

    #[test]
    fn model_url_enables_delegation() {
        let dir = tempfile::tempdir().unwrap();
        let plain = CoreState::from_config(config(&dir, &[])).unwrap();
        assert!(!plain.executor().has_model());

        let with_model = CoreState::from_config(config(
            &dir,
            &[("PHARMASSIST_MODEL_URL", "http://127.0.0.1:11434")],
        ))
        .unwrap();
        assert!(with_model.executor().has_model());
    }

    #[test]
    fn trace_hub_shares_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let core = CoreState::new(config(&dir, &[]));
        assert_eq!(core.trace().db_path(), core.config().db_path.as_path());
    }
}
