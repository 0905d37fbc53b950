//! Run endpoints.
//!
//! - `POST /runs` — validate, persist `created`, spawn the pipeline
//! - `GET /runs/:run_id` — current snapshot
//! - `POST /runs/:run_id/follow-up` — new run with merged answers
//! - `POST /runs/:run_id/stream-token` — one-time event stream credential

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, Caller};
use crate::db;
use crate::models::{FollowUpAnswer, Language, Run, RunInput, Trigger};
use crate::pipeline::orchestrator::{prepare_follow_up, prepare_run, spawn_run};

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub case_ref: Option<String>,
    #[serde(default)]
    pub patient_ref: Option<String>,
    #[serde(default)]
    pub visit_ref: Option<String>,
    #[serde(default = "default_language")]
    pub language: Language,
    #[serde(default = "default_trigger")]
    pub trigger: Trigger,
    #[serde(default)]
    pub follow_up_answers: Vec<FollowUpAnswer>,
}

fn default_language() -> Language {
    Language::Fr
}

fn default_trigger() -> Trigger {
    Trigger::Manual
}

impl From<CreateRunRequest> for RunInput {
    fn from(req: CreateRunRequest) -> Self {
        RunInput {
            case_ref: req.case_ref,
            patient_ref: req.patient_ref,
            visit_ref: req.visit_ref,
            language: req.language,
            trigger: req.trigger,
            follow_up_answers: req.follow_up_answers,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FollowUpRequest {
    #[serde(default)]
    pub follow_up_answers: Vec<FollowUpAnswer>,
}

#[derive(Debug, Serialize)]
pub struct StreamTokenResponse {
    pub token: String,
    pub expires_in_sec: u64,
}

/// Body rejections become our own 400 without echoing the payload.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v).map_err(|rejection| {
        tracing::debug!(status = %rejection.status(), "Rejected request body");
        ApiError::BadRequest("Request body is not valid JSON for this endpoint".into())
    })
}

fn load_run(ctx: &ApiContext, run_id: &str) -> Result<Run, ApiError> {
    let conn = ctx.core.open_db()?;
    db::get_run(&conn, run_id)?.ok_or_else(|| ApiError::NotFound("Unknown run_id".into()))
}

/// `POST /runs` — returns the `created` snapshot; the pipeline runs in
/// the background and is observed through the event stream.
pub async fn create(
    State(ctx): State<ApiContext>,
    body: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let input: RunInput = json_body(body)?.into();
    let prepared = prepare_run(&ctx.core, input)?;
    let run = prepared.run.clone();
    spawn_run(ctx.core.clone(), prepared);
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// `GET /runs/:run_id`
pub async fn get(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    load_run(&ctx, &run_id).map(Json)
}

/// `POST /runs/:run_id/follow-up` — the prior run must be terminal; it is
/// left untouched.
pub async fn follow_up(
    State(ctx): State<ApiContext>,
    Path(run_id): Path<String>,
    body: Result<Json<FollowUpRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let request = json_body(body)?;
    let prepared = prepare_follow_up(&ctx.core, &run_id, &request.follow_up_answers)?;
    let run = prepared.run.clone();
    spawn_run(ctx.core.clone(), prepared);
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// `POST /runs/:run_id/stream-token`
pub async fn stream_token(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(run_id): Path<String>,
) -> Result<Json<StreamTokenResponse>, ApiError> {
    let run = load_run(&ctx, &run_id)?;
    let mut store = ctx
        .stream_tokens
        .lock()
        .map_err(|_| ApiError::Internal("stream token lock".into()))?;
    let token = store.issue(&run.run_id, &caller);
    Ok(Json(StreamTokenResponse {
        token,
        expires_in_sec: store.ttl().as_secs(),
    }))
}
