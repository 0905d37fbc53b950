//! Step fixture: owned inputs plus a real trace hub on a temp database.

use tempfile::TempDir;

use super::{ArtifactBag, StepContext, StepName, REGISTRY};
use crate::cases::load_case_bundle;
use crate::db::{insert_run, open_database};
use crate::models::{
    FollowUpAnswer, IntakeExtracted, Language, PatientContext, Product, Run, RunInput,
};
use crate::pipeline::follow_up::AnswerMap;
use crate::pipeline::trace::TraceHub;

pub(crate) struct Fixture {
    pub run_id: String,
    pub visit_ref: Option<String>,
    pub language: Language,
    pub intake_text: String,
    pub patient: PatientContext,
    pub products: Vec<Product>,
    pub prefilled: Option<IntakeExtracted>,
    pub answers: AnswerMap,
    pub bag: ArtifactBag,
    pub hub: TraceHub,
    _dir: TempDir,
}

impl Fixture {
    /// Patient and products of `case_000042`, with the given intake text.
    pub fn new(intake_text: &str) -> Self {
        let mut fx = Self::for_case("case_000042", Language::En);
        fx.intake_text = intake_text.to_string();
        fx
    }

    pub fn for_case(case_ref: &str, language: Language) -> Self {
        let bundle = load_case_bundle(case_ref).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("steps.db");
        let conn = open_database(&db_path).unwrap();
        let run = Run::new(RunInput::for_case(case_ref, language));
        insert_run(&conn, &run).unwrap();

        Self {
            run_id: run.run_id,
            visit_ref: None,
            language,
            intake_text: bundle.intake_text_ocr.for_language(language).to_string(),
            patient: bundle.llm_context,
            products: bundle.products,
            prefilled: None,
            answers: AnswerMap::default(),
            bag: ArtifactBag::default(),
            hub: TraceHub::new(db_path),
            _dir: dir,
        }
    }

    pub fn with_answers(mut self, answers: &[(&str, &str)]) -> Self {
        let answers: Vec<FollowUpAnswer> = answers
            .iter()
            .map(|(q, a)| FollowUpAnswer {
                question_id: q.to_string(),
                answer: a.to_string(),
            })
            .collect();
        self.answers = AnswerMap::from_answers(&answers);
        self
    }

    pub fn ctx(&self) -> StepContext<'_> {
        StepContext {
            run_id: &self.run_id,
            visit_ref: self.visit_ref.as_deref(),
            language: self.language,
            intake_text: &self.intake_text,
            patient: &self.patient,
            products: &self.products,
            prefilled_intake: self.prefilled.as_ref(),
            answers: &self.answers,
            bag: &self.bag,
            trace: &self.hub,
        }
    }

    /// Run the deterministic variant of every step before `until`,
    /// honoring the escalation skip.
    pub fn advance_to(&mut self, until: StepName) -> &mut Self {
        for step in REGISTRY.iter().take_while(|s| s.name() < until) {
            if self.bag.escalated() && step.name().skipped_on_escalation() {
                continue;
            }
            let outcome = step.run(&self.ctx()).unwrap();
            self.bag.apply(outcome.output);
        }
        self
    }
}
