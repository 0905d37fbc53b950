//! HTTP router.
//!
//! Three route families, each with its own guard:
//! - open: `/healthz`, and the event stream (authenticated in its handler)
//! - data: `X-Api-Key` or loopback fallback
//! - admin: audit → `X-Admin-Key` or loopback fallback → rate limit
//!
//! Middleware reads `Extension<ApiContext>` (outermost layer of each
//! family); handlers read `State<ApiContext>`.

use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints::{admin, documents, events, health, patients, runs};
use crate::api::middleware::{audit, auth, rate};
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Origins of the local demo UI.
const UI_ORIGINS: &[&str] = &["http://localhost:5173", "http://127.0.0.1:5173"];

/// Build the full API router for `core`.
pub fn api_router(core: Arc<CoreState>) -> Router {
    build_router(ApiContext::new(core))
}

fn cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = UI_ORIGINS
        .iter()
        .map(|o| HeaderValue::from_static(o))
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-admin-key"),
        ])
}

/// Build the router from a pre-constructed context.
pub(crate) fn build_router(ctx: ApiContext) -> Router {
    // NOTE: path params use `:param` syntax (axum 0.7).
    let data = Router::new()
        .route("/runs", post(runs::create))
        .route("/runs/:run_id", get(runs::get))
        .route("/runs/:run_id/follow-up", post(runs::follow_up))
        .route("/runs/:run_id/stream-token", post(runs::stream_token))
        .route("/patients", get(patients::search))
        .route("/patients/inbox", get(patients::inbox))
        .route("/patients/:patient_ref/visits", get(patients::visits))
        .route(
            "/patients/:patient_ref/analysis-status",
            get(patients::analysis_status),
        )
        .route("/patients/:patient_ref/refresh", post(patients::refresh))
        .route(
            "/documents/prescription",
            post(documents::upload_prescription),
        )
        .with_state(ctx.clone())
        .layer(from_fn(auth::require_api_key))
        .layer(Extension(ctx.clone()));

    // Innermost first: the limiter needs the caller resolved by auth, and
    // the audit layer must see every outcome, including auth failures.
    let admin = Router::new()
        .route("/admin/db-preview/tables", get(admin::tables))
        .route("/admin/db-preview", get(admin::db_preview))
        .route("/admin/audit-events", get(admin::audit_events))
        .with_state(ctx.clone())
        .layer(from_fn(rate::limit))
        .layer(from_fn(auth::require_admin_key))
        .layer(from_fn(audit::record_admin_access))
        .layer(Extension(ctx.clone()));

    let open = Router::new()
        .route("/healthz", get(health::check))
        .route("/runs/:run_id/events", get(events::stream))
        .with_state(ctx);

    Router::new()
        .merge(open)
        .merge(data)
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(cors())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::db;
    use crate::ingest::pdf::make_test_pdf;
    use crate::models::AuditOutcome;

    const LOOPBACK: ([u8; 4], u16) = ([127, 0, 0, 1], 41000);
    const REMOTE: ([u8; 4], u16) = ([192, 168, 1, 20], 41000);

    fn test_core(configure: impl FnOnce(&mut AppConfig)) -> (Arc<CoreState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::with_db_path(dir.path().join("api.db"));
        configure(&mut config);
        let core = CoreState::new(config);
        core.initialize().unwrap();
        (Arc::new(core), dir)
    }

    fn app_from(core: &Arc<CoreState>, peer: ([u8; 4], u16)) -> Router {
        api_router(core.clone()).layer(MockConnectInfo(SocketAddr::from(peer)))
    }

    fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body).unwrap()
    }

    fn get_req(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        request("GET", uri, headers, Body::empty())
    }

    fn post_json(uri: &str, headers: &[(&str, &str)], json: serde_json::Value) -> Request<Body> {
        let mut all = vec![("Content-Type", "application/json")];
        all.extend_from_slice(headers);
        request("POST", uri, &all, Body::from(json.to_string()))
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn response_text(response: Response) -> String {
        let body = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
            .await
            .expect("stream did not end")
            .unwrap()
            .to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    /// Create a run and poll until it reaches a terminal status.
    async fn finished_run(app: &Router, headers: &[(&str, &str)], body: serde_json::Value) -> serde_json::Value {
        let created = send(app, post_json("/runs", headers, body)).await;
        assert_eq!(created.status(), StatusCode::ACCEPTED);
        let created = response_json(created).await;
        assert_eq!(created["status"], "created");
        let run_id = created["run_id"].as_str().unwrap().to_string();

        for _ in 0..200 {
            let snapshot = response_json(send(app, get_req(&format!("/runs/{run_id}"), headers)).await).await;
            let status = snapshot["status"].as_str().unwrap();
            if matches!(status, "completed" | "needs_more_info" | "failed") {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {run_id} did not finish");
    }

    // ── Open routes ─────────────────────────────────────────

    #[tokio::test]
    async fn healthz_is_open_to_any_peer() {
        let (core, _dir) = test_core(|c| c.security.api_key = Some("k".into()));
        let app = app_from(&core, REMOTE);

        let response = send(&app, get_req("/healthz", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::config::APP_VERSION);
    }

    // ── Data guard ──────────────────────────────────────────

    #[tokio::test]
    async fn loopback_fallback_admits_local_callers_only() {
        let (core, _dir) = test_core(|_| {});

        let local = send(&app_from(&core, LOOPBACK), get_req("/patients", &[])).await;
        assert_eq!(local.status(), StatusCode::OK);
        let json = response_json(local).await;
        assert_eq!(json["patients"].as_array().unwrap().len(), 4);

        let remote = send(&app_from(&core, REMOTE), get_req("/patients", &[])).await;
        assert_eq!(remote.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response_json(remote).await["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn proxy_headers_defeat_loopback_fallback() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);
        for name in ["Forwarded", "X-Forwarded-For", "X-Forwarded-Host", "X-Forwarded-Proto", "X-Real-IP"] {
            let response = send(&app, get_req("/patients", &[(name, "127.0.0.1")])).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{name}");
        }
    }

    #[tokio::test]
    async fn configured_api_key_is_required_even_on_loopback() {
        let (core, _dir) = test_core(|c| c.security.api_key = Some("data-secret".into()));
        let app = app_from(&core, LOOPBACK);

        let missing = send(&app, get_req("/patients", &[])).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let wrong = send(&app, get_req("/patients", &[("X-Api-Key", "nope")])).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        let ok = send(&app, get_req("/patients", &[("X-Api-Key", "data-secret")])).await;
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn require_api_key_disables_fallback() {
        let (core, _dir) = test_core(|c| c.security.require_api_key = true);
        let response = send(&app_from(&core, LOOPBACK), get_req("/patients", &[])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ── Patients ────────────────────────────────────────────

    #[tokio::test]
    async fn patient_search_validates_and_clamps() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let json = response_json(send(&app, get_req("/patients?query=pt_000001&limit=500", &[])).await).await;
        let patients = json["patients"].as_array().unwrap();
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0]["patient_ref"], "pt_000001");

        let long = "a".repeat(65);
        let response = send(&app, get_req(&format!("/patients?query={long}"), &[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app, get_req("/patients?limit=many", &[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn visits_listing_is_redacted_and_404s_unknown_patients() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let response = send(&app, get_req("/patients/pt_000000/visits", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        for visit in json["visits"].as_array().unwrap() {
            assert!(visit.get("intake_extracted").is_none());
            assert!(visit["symptom_count"].is_u64());
        }

        let missing = send(&app, get_req("/patients/pt_999999/visits", &[])).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    async fn analysis_status(app: &Router, patient_ref: &str) -> serde_json::Value {
        let uri = format!("/patients/{patient_ref}/analysis-status");
        let response = send(app, get_req(&uri, &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await
    }

    #[tokio::test]
    async fn analysis_status_and_inbox_before_any_refresh() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let status = analysis_status(&app, "pt_000001").await;
        assert_eq!(status["status"], "refresh_pending");
        assert_eq!(status["changed_since_last_analysis"], true);
        assert_eq!(status["latest_visit_ref"], "visit_000001");
        assert_eq!(status["message"], "New data detected; refresh is pending.");

        let missing = send(&app, get_req("/patients/pt_999999/analysis-status", &[])).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let inbox = response_json(send(&app, get_req("/patients/inbox?limit=2", &[])).await).await;
        assert_eq!(inbox["count"], 2);
        assert_eq!(inbox["patients"][0]["patient_ref"], "pt_000001");
        let bad = send(&app, get_req("/patients/inbox?limit=lots", &[])).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let remote = send(&app_from(&core, REMOTE), get_req("/patients/inbox", &[])).await;
        assert_eq!(remote.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_coalesces_and_brings_patient_up_to_date() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let first = send(&app, request("POST", "/patients/pt_000001/refresh", &[], Body::empty())).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first = response_json(first).await;
        assert_eq!(first["queued"], true);
        assert_eq!(first["refresh_reason"], "manual");

        let second = send(
            &app,
            post_json("/patients/pt_000001/refresh", &[], serde_json::json!({"reason": "follow_up"})),
        )
        .await;
        assert_eq!(second.status(), StatusCode::ACCEPTED);
        assert_eq!(response_json(second).await["queued"], false);

        let mut status = serde_json::Value::Null;
        for _ in 0..200 {
            status = analysis_status(&app, "pt_000001").await;
            if status["status"] == "up_to_date" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status["status"], "up_to_date");
        assert_eq!(status["latest_run_status"], "completed");
        assert_eq!(status["changed_since_last_analysis"], false);
        let run_id = status["latest_run_id"].as_str().unwrap();
        let run = response_json(send(&app, get_req(&format!("/runs/{run_id}"), &[])).await).await;
        assert_eq!(run["input"]["trigger"], "scheduled_refresh");

        let inbox = response_json(send(&app, get_req("/patients/inbox", &[])).await).await;
        assert!(inbox["patients"]
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["patient_ref"] != "pt_000001"));
    }

    #[tokio::test]
    async fn refresh_rejects_unknown_patients_and_free_text_reasons() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let unknown = send(&app, request("POST", "/patients/pt_999999/refresh", &[], Body::empty())).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let reason = "Call jane.doe@example.com";
        let response = send(
            &app,
            post_json("/patients/pt_000001/refresh", &[], serde_json::json!({"reason": reason})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response_json(response).await.to_string().contains("jane.doe"));

        let extra = post_json("/patients/pt_000001/refresh", &[], serde_json::json!({"note": "x"}));
        assert_eq!(send(&app, extra).await.status(), StatusCode::BAD_REQUEST);
    }

    // ── Runs & stream ───────────────────────────────────────

    #[tokio::test]
    async fn run_lifecycle_and_event_stream() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let run = finished_run(&app, &[], serde_json::json!({"case_ref": "case_000042", "language": "en"})).await;
        assert_eq!(run["status"], "completed");
        assert!(run["artifacts"]["report_markdown"].is_string());
        let run_id = run["run_id"].as_str().unwrap();

        let response = send(&app, get_req(&format!("/runs/{run_id}/events"), &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let body = response_text(response).await;
        assert!(body.contains("event: step_started"));
        assert!(body.contains("id: "));
        assert_eq!(body.matches("event: finalized").count(), 1);
        assert!(!body.contains("event: failed"));
    }

    #[tokio::test]
    async fn invalid_run_input_is_a_validation_error() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let both = post_json(
            "/runs",
            &[],
            serde_json::json!({"case_ref": "case_000042", "visit_ref": "visit_000000"}),
        );
        let response = send(&app, both).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["error"]["code"], "VALIDATION_FAILED");

        let garbage = request("POST", "/runs", &[("Content-Type", "application/json")], Body::from("{"));
        assert_eq!(send(&app, garbage).await.status(), StatusCode::BAD_REQUEST);

        let unknown = send(&app, get_req("/runs/does-not-exist", &[])).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let no_case = post_json("/runs", &[], serde_json::json!({"case_ref": "case_999999"}));
        assert_eq!(send(&app, no_case).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn follow_up_creates_a_new_run() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let first = finished_run(&app, &[], serde_json::json!({"case_ref": "case_lowinfo_000102", "language": "en"})).await;
        assert_eq!(first["status"], "needs_more_info");
        let prior_id = first["run_id"].as_str().unwrap();

        let bad = post_json(
            &format!("/runs/{prior_id}/follow-up"),
            &[],
            serde_json::json!({"follow_up_answers": [{"question_id": "q_fever", "answer": "maybe"}]}),
        );
        assert_eq!(send(&app, bad).await.status(), StatusCode::BAD_REQUEST);

        let good = post_json(
            &format!("/runs/{prior_id}/follow-up"),
            &[],
            serde_json::json!({"follow_up_answers": [{"question_id": "q_primary_domain", "answer": "digestive"}]}),
        );
        let response = send(&app, good).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let rerun = response_json(response).await;
        assert_ne!(rerun["run_id"], first["run_id"]);
        assert_eq!(rerun["input"]["case_ref"], "case_lowinfo_000102");
        assert_eq!(rerun["input"]["follow_up_answers"][0]["question_id"], "q_primary_domain");

        // The prior run is untouched.
        let prior = response_json(send(&app, get_req(&format!("/runs/{prior_id}"), &[])).await).await;
        assert_eq!(prior["status"], "needs_more_info");
    }

    async fn issue_token(app: &Router, run_id: &str, headers: &[(&str, &str)]) -> String {
        let uri = format!("/runs/{run_id}/stream-token");
        let response = send(app, post_json(&uri, headers, serde_json::json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["expires_in_sec"], 60);
        json["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn stream_requires_single_use_run_bound_token_when_keyed() {
        let (core, _dir) = test_core(|c| c.security.api_key = Some("data-secret".into()));
        let app = app_from(&core, LOOPBACK);
        let key = [("X-Api-Key", "data-secret")];

        let run_a = finished_run(&app, &key, serde_json::json!({"case_ref": "case_000042"})).await;
        let run_b = finished_run(&app, &key, serde_json::json!({"case_ref": "case_000042"})).await;
        let run_a = run_a["run_id"].as_str().unwrap();
        let run_b = run_b["run_id"].as_str().unwrap();

        // Loopback alone is not enough, nor is the API key.
        let bare = send(&app, get_req(&format!("/runs/{run_a}/events"), &key)).await;
        assert_eq!(bare.status(), StatusCode::UNAUTHORIZED);

        let token = issue_token(&app, run_a, &key).await;
        let uri = format!("/runs/{run_a}/events?token={token}");
        let first = send(&app, get_req(&uri, &[])).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert!(response_text(first).await.contains("event: finalized"));
        let replay = send(&app, get_req(&uri, &[])).await;
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);

        let token = issue_token(&app, run_a, &key).await;
        let cross = send(&app, get_req(&format!("/runs/{run_b}/events?token={token}"), &[])).await;
        assert_eq!(cross.status(), StatusCode::UNAUTHORIZED);

        let unknown = send(&app, post_json("/runs/nope/stream-token", &key, serde_json::json!({}))).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unkeyed_stream_rejects_remote_and_proxied_callers() {
        let (core, _dir) = test_core(|_| {});
        let local = app_from(&core, LOOPBACK);
        let run = finished_run(&local, &[], serde_json::json!({"case_ref": "case_000042"})).await;
        let uri = format!("/runs/{}/events", run["run_id"].as_str().unwrap());

        let remote = send(&app_from(&core, REMOTE), get_req(&uri, &[])).await;
        assert_eq!(remote.status(), StatusCode::UNAUTHORIZED);
        let proxied = send(&local, get_req(&uri, &[("X-Forwarded-For", "10.0.0.1")])).await;
        assert_eq!(proxied.status(), StatusCode::UNAUTHORIZED);
        let missing = send(&local, get_req("/runs/nope/events", &[])).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    // ── Documents ───────────────────────────────────────────

    #[tokio::test]
    async fn prescription_upload_outcomes() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);
        let pdf = make_test_pdf(&["SYNTHETIC PRESCRIPTION\n- sneezing (moderate, 3d)"]);
        let upload = |uri: &str, content_type: &str, bytes: Vec<u8>| {
            request("POST", uri, &[("Content-Type", content_type)], Body::from(bytes))
        };

        let response = send(
            &app,
            upload("/documents/prescription?patient_ref=pt_000000&language=en", "application/pdf", pdf.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let receipt = response_json(response).await;
        assert_eq!(receipt["status"], "ingested");
        assert!(receipt["visit_ref"].as_str().unwrap().starts_with("visit_doc_"));
        assert!(receipt.get("text").is_none());

        let visits = response_json(send(&app, get_req("/patients/pt_000000/visits", &[])).await).await;
        assert!(visits["visits"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v["visit_ref"] == receipt["visit_ref"]));

        let wrong_type = send(
            &app,
            upload("/documents/prescription?patient_ref=pt_000000", "text/plain", pdf.clone()),
        )
        .await;
        assert_eq!(wrong_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let unknown = send(
            &app,
            upload("/documents/prescription?patient_ref=pt_999999", "application/pdf", pdf.clone()),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let not_pdf = send(
            &app,
            upload("/documents/prescription?patient_ref=pt_000000", "application/pdf", b"hello".to_vec()),
        )
        .await;
        assert_eq!(not_pdf.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response_json(not_pdf).await["error"]["code"], "MALFORMED_DOCUMENT");

        let missing_patient = send(&app, upload("/documents/prescription", "application/pdf", pdf)).await;
        assert_eq!(missing_patient.status(), StatusCode::BAD_REQUEST);

        let state = db::get_patient_analysis_state(&core.open_db().unwrap(), "pt_000000")
            .unwrap()
            .unwrap();
        assert_eq!(state.refresh_reason.as_deref(), Some("ocr_upload"));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (core, _dir) = test_core(|c| c.uploads.max_bytes = 128);
        let app = app_from(&core, LOOPBACK);
        let mut body = b"%PDF-1.5\n".to_vec();
        body.resize(4096, b' ');
        let response = send(
            &app,
            request(
                "POST",
                "/documents/prescription?patient_ref=pt_000000",
                &[("Content-Type", "application/pdf")],
                Body::from(body),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn phi_bearing_upload_is_rejected_with_doc_ref() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);
        let pdf = make_test_pdf(&["Nom: Lucy Martin\n- sneezing (mild, 1d)"]);
        let response = send(
            &app,
            request(
                "POST",
                "/documents/prescription?patient_ref=pt_000000",
                &[("Content-Type", "application/pdf")],
                Body::from(pdf),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        assert_eq!(json["error"]["code"], "PHI_BOUNDARY");
        let doc_ref = json["error"]["doc_ref"].as_str().unwrap();
        assert!(!json.to_string().contains("Lucy"));

        let conn = core.open_db().unwrap();
        let doc = db::get_document(&conn, doc_ref).unwrap().unwrap();
        assert_eq!(doc.status, "failed_phi_boundary");
    }

    // ── Admin ───────────────────────────────────────────────

    #[tokio::test]
    async fn admin_preview_is_redacted_and_allowlisted() {
        let (core, _dir) = test_core(|_| {});
        let app = app_from(&core, LOOPBACK);

        let tables = response_json(send(&app, get_req("/admin/db-preview/tables", &[])).await).await;
        assert!(tables["tables"].as_array().unwrap().iter().any(|t| t == "patients"));

        let response = send(&app, get_req("/admin/db-preview?table=patients&query=pt_&limit=2", &[])).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["redacted"], true);
        assert_eq!(json["rows"].as_array().unwrap().len(), 2);
        assert!(json["rows"][0].get("llm_context_json").is_none());

        let injected = send(
            &app,
            get_req("/admin/db-preview?table=patients%3B%20DROP%20TABLE%20patients&query=x", &[]),
        )
        .await;
        assert_eq!(injected.status(), StatusCode::BAD_REQUEST);

        let conn = core.open_db().unwrap();
        let events = db::list_admin_audit_events(&conn, 10).unwrap();
        assert_eq!(events.len(), 3);
        // Newest first: the rejected injection attempt.
        assert_eq!(events[0].outcome, AuditOutcome::ValidationFailed);
        assert_eq!(events[0].table_name, None);
        assert_eq!(events[0].query_len, 1);
        assert_eq!(events[1].table_name.as_deref(), Some("patients"));
        assert_eq!(events[1].caller, "loopback");
        assert!(events[1].query_sha256_12.is_some());
    }

    #[tokio::test]
    async fn admin_key_failures_are_audited() {
        let (core, _dir) = test_core(|c| c.security.admin_api_key = Some("admin-secret".into()));
        let app = app_from(&core, LOOPBACK);

        let denied = send(&app, get_req("/admin/db-preview/tables", &[("X-Admin-Key", "wrong")])).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        // The data key does not open admin routes.
        let data_key = send(&app, get_req("/admin/db-preview/tables", &[("X-Api-Key", "admin-secret")])).await;
        assert_eq!(data_key.status(), StatusCode::UNAUTHORIZED);
        let ok = send(&app, get_req("/admin/db-preview/tables", &[("X-Admin-Key", "admin-secret")])).await;
        assert_eq!(ok.status(), StatusCode::OK);

        let conn = core.open_db().unwrap();
        let events = db::list_admin_audit_events(&conn, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].caller, "unauthenticated");
        assert_eq!(events[2].outcome, AuditOutcome::Unauthorized);
        assert!(events[0].caller.starts_with("key:"));
        assert!(!events[0].caller.contains("admin-secret"));
        assert_eq!(events[0].outcome, AuditOutcome::Allowed);
    }

    #[tokio::test]
    async fn admin_rate_limit_returns_429_and_is_audited() {
        let (core, _dir) = test_core(|c| c.security.admin_rate_limit_max = 2);
        let app = app_from(&core, LOOPBACK);

        for _ in 0..2 {
            let ok = send(&app, get_req("/admin/db-preview/tables", &[])).await;
            assert_eq!(ok.status(), StatusCode::OK);
        }
        let limited = send(&app, get_req("/admin/db-preview/tables", &[])).await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = limited
            .headers()
            .get("Retry-After")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));

        let conn = core.open_db().unwrap();
        let events = db::list_admin_audit_events(&conn, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].outcome, AuditOutcome::RateLimited);
        assert_eq!(events[0].status_code, 429);
    }
}
