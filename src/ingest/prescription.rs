use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::{IngestError, PdfText, PdfTextExtractor};
use crate::config::UploadLimits;
use crate::db::{self, DocumentRecord};
use crate::models::{Language, PrimaryDomain, Visit};
use crate::pipeline::steps::intake::{extract_intake_deterministic, infer_primary_domain};
use crate::pipeline::text::truncate_chars;
use crate::privacy::{raise_if_phi, redact_phi_text, sha256_12};

/// Extracted text beyond this is scanned but not parsed.
const MAX_INTAKE_TEXT_CHARS: usize = 50_000;

pub const STATUS_INGESTED: &str = "ingested";
pub const STATUS_FAILED_PHI: &str = "failed_phi_boundary";
const VISIT_SOURCE: &str = "prescription_upload";
const EVENT_KIND: &str = "prescription_upload";

/// One raw upload as received by the HTTP layer.
#[derive(Debug, Clone)]
pub struct PrescriptionUpload {
    pub patient_ref: String,
    pub language: Language,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Metadata-only outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub status: &'static str,
    pub doc_ref: String,
    pub event_ref: String,
    pub visit_ref: String,
    pub patient_ref: String,
    pub occurred_at: String,
    pub sha256_12: String,
    pub page_count: usize,
    pub text_length: usize,
    pub redaction_replacements: usize,
    pub primary_domain: PrimaryDomain,
}

fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

pub(crate) fn is_pdf_media_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/pdf"))
}

/// Cheap checks that need neither the database nor the parser.
fn precheck(upload: &PrescriptionUpload, limits: &UploadLimits) -> Result<(), IngestError> {
    if !is_pdf_media_type(upload.content_type.as_deref()) {
        return Err(IngestError::UnsupportedMediaType);
    }
    if upload.bytes.len() > limits.max_bytes {
        return Err(IngestError::PayloadTooLarge {
            max_bytes: limits.max_bytes,
        });
    }
    if !upload.bytes.starts_with(b"%PDF-") {
        return Err(IngestError::MalformedDocument("Invalid PDF header"));
    }
    Ok(())
}

/// Text-layer extraction on a blocking thread, bounded by the configured
/// timeout. A timed-out parse keeps running detached; its result is dropped.
async fn extract_text(
    extractor: Arc<dyn PdfTextExtractor>,
    limits: &UploadLimits,
    bytes: Vec<u8>,
) -> Result<PdfText, IngestError> {
    let max_pages = limits.max_pages;
    let task = tokio::task::spawn_blocking(move || extractor.extract(&bytes, max_pages));

    let extracted = match tokio::time::timeout(limits.extract_timeout, task).await {
        Err(_) => return Err(IngestError::MalformedDocument("PDF extraction timed out")),
        Ok(Err(join_err)) => {
            tracing::warn!(error = %join_err, "PDF extraction task aborted");
            return Err(IngestError::MalformedDocument(
                "Invalid or unreadable PDF payload",
            ));
        }
        Ok(Ok(result)) => result?,
    };

    if extracted.text.is_empty() {
        return Err(IngestError::MalformedDocument(
            "PDF text-layer extraction returned empty text",
        ));
    }
    Ok(extracted)
}

/// Ingest a prescription PDF for a known patient.
///
/// On success a visit (`visit_doc_<hex>`), a pharmacy event and a document
/// row are written atomically. A PHI boundary hit writes only a
/// `failed_phi_boundary` document row and returns `PhiRejected`.
pub async fn ingest_prescription_pdf(
    db_path: &Path,
    extractor: Arc<dyn PdfTextExtractor>,
    limits: &UploadLimits,
    upload: PrescriptionUpload,
) -> Result<IngestReceipt, IngestError> {
    precheck(&upload, limits)?;
    {
        let conn = db::open_database(db_path)?;
        if db::get_patient(&conn, &upload.patient_ref)?.is_none() {
            return Err(IngestError::UnknownPatient);
        }
    }

    let PrescriptionUpload {
        patient_ref,
        language,
        bytes,
        ..
    } = upload;

    let doc_ref = format!("doc_{}", short_id());
    let sha = sha256_12(&bytes);
    let byte_len = bytes.len();
    let occurred_at = chrono::Utc::now().to_rfc3339();

    let extracted = extract_text(extractor, limits, bytes).await?;
    let page_count = extracted.page_count;
    let intake_text = truncate_chars(&extracted.text, MAX_INTAKE_TEXT_CHARS);
    let text_length = intake_text.chars().count();

    // The boundary covers the whole text, not only the parsed slice.
    let redacted_full = redact_phi_text(&extracted.text);
    let redacted = redact_phi_text(&intake_text);
    drop(extracted);

    let mut conn = db::open_database(db_path)?;

    if let Err(phi) = raise_if_phi(&redacted_full.text, "$.documents.prescription.redacted_text") {
        let codes: Vec<&str> = phi.violations.iter().map(|v| v.code.as_str()).collect();
        insert_document_row(
            &conn,
            &doc_ref,
            &patient_ref,
            &occurred_at,
            STATUS_FAILED_PHI,
            &sha,
            page_count,
            json!({
                "status": STATUS_FAILED_PHI,
                "byte_len": byte_len,
                "text_length": text_length,
                "redaction_replacements": redacted.replacements,
                "violation_codes": codes,
            }),
        )?;
        tracing::warn!(%doc_ref, sha256_12 = %sha, codes = ?codes, "Prescription rejected at PHI boundary");
        return Err(IngestError::PhiRejected {
            doc_ref,
            violations: phi.violations,
        });
    }

    let intake = extract_intake_deterministic(&redacted.text, language);
    let primary_domain = infer_primary_domain(&intake);
    let event_ref = format!("ev_doc_{}", short_id());
    let visit_ref = format!("visit_doc_{}", short_id());

    let tx = conn.transaction().map_err(db::DatabaseError::from)?;
    db::upsert_visit(
        &tx,
        &Visit {
            visit_ref: visit_ref.clone(),
            patient_ref: patient_ref.clone(),
            occurred_at: occurred_at.clone(),
            primary_domain: primary_domain.as_str().to_string(),
            source: VISIT_SOURCE.to_string(),
            intake_extracted: Some(intake),
        },
    )?;
    db::insert_pharmacy_event(
        &tx,
        &event_ref,
        &patient_ref,
        Some(&visit_ref),
        &occurred_at,
        EVENT_KIND,
        &json!({
            "doc_ref": doc_ref,
            "sha256_12": sha,
            "page_count": page_count,
            "text_length": text_length,
            "redaction_applied": redacted.replacements > 0,
            "redaction_replacements": redacted.replacements,
        }),
    )?;
    insert_document_row(
        &tx,
        &doc_ref,
        &patient_ref,
        &occurred_at,
        STATUS_INGESTED,
        &sha,
        page_count,
        json!({
            "status": STATUS_INGESTED,
            "byte_len": byte_len,
            "event_ref": event_ref,
            "visit_ref": visit_ref,
            "text_length": text_length,
            "redaction_replacements": redacted.replacements,
            "primary_domain": primary_domain.as_str(),
        }),
    )?;
    tx.commit().map_err(db::DatabaseError::from)?;

    tracing::info!(
        %doc_ref,
        %visit_ref,
        sha256_12 = %sha,
        page_count,
        text_length,
        redactions = redacted.replacements,
        domain = %primary_domain,
        "Prescription ingested"
    );

    Ok(IngestReceipt {
        status: STATUS_INGESTED,
        doc_ref,
        event_ref,
        visit_ref,
        patient_ref,
        occurred_at,
        sha256_12: sha,
        page_count,
        text_length,
        redaction_replacements: redacted.replacements,
        primary_domain,
    })
}

#[allow(clippy::too_many_arguments)]
fn insert_document_row(
    conn: &rusqlite::Connection,
    doc_ref: &str,
    patient_ref: &str,
    created_at: &str,
    status: &str,
    sha: &str,
    page_count: usize,
    metadata: serde_json::Value,
) -> Result<(), db::DatabaseError> {
    db::insert_document(
        conn,
        &DocumentRecord {
            doc_ref: doc_ref.to_string(),
            patient_ref: Some(patient_ref.to_string()),
            created_at: created_at.to_string(),
            status: status.to_string(),
            sha256_12: sha.to_string(),
            page_count,
            metadata,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::pdf::{make_test_pdf, LopdfExtractor, PdfError};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ingest.db");
        let conn = db::open_database(&db_path).unwrap();
        db::seed_demo_dataset(&conn).unwrap();
        Fixture { _dir: dir, db_path }
    }

    fn upload(bytes: Vec<u8>) -> PrescriptionUpload {
        PrescriptionUpload {
            patient_ref: "pt_000000".into(),
            language: Language::En,
            content_type: Some("application/pdf".into()),
            bytes,
        }
    }

    async fn ingest(fx: &Fixture, up: PrescriptionUpload) -> Result<IngestReceipt, IngestError> {
        ingest_prescription_pdf(
            &fx.db_path,
            Arc::new(LopdfExtractor),
            &UploadLimits::default(),
            up,
        )
        .await
    }

    /// Sleeps past any reasonable timeout.
    struct SlowExtractor;

    impl PdfTextExtractor for SlowExtractor {
        fn extract(&self, _bytes: &[u8], _max_pages: usize) -> Result<PdfText, PdfError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(PdfText {
                text: "- sneezing (mild, 2d)".into(),
                page_count: 1,
            })
        }
    }

    struct EncryptedExtractor;

    impl PdfTextExtractor for EncryptedExtractor {
        fn extract(&self, _bytes: &[u8], _max_pages: usize) -> Result<PdfText, PdfError> {
            Err(PdfError::Encrypted)
        }
    }

    #[tokio::test]
    async fn clean_prescription_creates_visit_event_and_document() {
        let fx = fixture();
        let pdf = make_test_pdf(&["SYNTHETIC PRESCRIPTION\n- sneezing (moderate, 3d)\n- itchy eyes (mild, 3d)"]);
        let receipt = ingest(&fx, upload(pdf)).await.unwrap();

        assert_eq!(receipt.status, STATUS_INGESTED);
        assert!(receipt.visit_ref.starts_with("visit_doc_"));
        assert_eq!(receipt.visit_ref.len(), "visit_doc_".len() + 12);
        assert!(receipt.doc_ref.starts_with("doc_"));
        assert_eq!(receipt.page_count, 1);
        assert_eq!(receipt.primary_domain, PrimaryDomain::AllergyEnt);

        let conn = db::open_database(&fx.db_path).unwrap();
        let visit = db::get_visit(&conn, &receipt.visit_ref).unwrap().unwrap();
        assert_eq!(visit.patient_ref, "pt_000000");
        assert_eq!(visit.source, VISIT_SOURCE);
        let intake = visit.intake_extracted.unwrap();
        assert!(intake.symptoms.iter().any(|s| s.label == "sneezing"));

        let doc = db::get_document(&conn, &receipt.doc_ref).unwrap().unwrap();
        assert_eq!(doc.status, STATUS_INGESTED);
        assert_eq!(doc.sha256_12, receipt.sha256_12);
        assert_eq!(doc.metadata["visit_ref"], receipt.visit_ref.as_str());
    }

    #[tokio::test]
    async fn labelled_identifiers_are_redacted_before_storage() {
        let fx = fixture();
        let pdf = make_test_pdf(&["Name: Lucy Martin\n- bloating (mild, 2d)"]);
        let receipt = ingest(&fx, upload(pdf)).await.unwrap();
        assert_eq!(receipt.redaction_replacements, 1);
        assert_eq!(receipt.primary_domain, PrimaryDomain::Digestive);

        let conn = db::open_database(&fx.db_path).unwrap();
        let doc = db::get_document(&conn, &receipt.doc_ref).unwrap().unwrap();
        let visit = db::get_visit(&conn, &receipt.visit_ref).unwrap().unwrap();
        let dumped = format!("{}{}", doc.metadata, serde_json::to_string(&visit).unwrap());
        assert!(!dumped.contains("Lucy"));
        assert!(!dumped.contains("Martin"));
    }

    #[tokio::test]
    async fn phi_after_redaction_is_rejected_with_metadata_row() {
        let fx = fixture();
        let pdf = make_test_pdf(&["Nom: Lucy Martin\nContact lucy.martin@example.org\n- sneezing (mild, 1d)"]);
        let err = ingest(&fx, upload(pdf)).await.unwrap_err();
        let IngestError::PhiRejected { doc_ref, violations } = err else {
            panic!("expected PhiRejected, got {err:?}");
        };
        assert!(violations.iter().any(|v| v.code == "PHI_LABEL"));

        let conn = db::open_database(&fx.db_path).unwrap();
        let doc = db::get_document(&conn, &doc_ref).unwrap().unwrap();
        assert_eq!(doc.status, STATUS_FAILED_PHI);
        let dumped = doc.metadata.to_string();
        assert!(!dumped.contains("Lucy"));
        assert!(!dumped.contains("example.org"));
        assert!(db::list_visits(&conn, "pt_000000")
            .unwrap()
            .iter()
            .all(|v| v.source != VISIT_SOURCE));
    }

    #[tokio::test]
    async fn rejects_wrong_media_type_and_oversize() {
        let fx = fixture();
        let mut up = upload(make_test_pdf(&["- sneezing (mild, 1d)"]));
        up.content_type = Some("text/plain".into());
        assert!(matches!(
            ingest(&fx, up).await,
            Err(IngestError::UnsupportedMediaType)
        ));

        let limits = UploadLimits {
            max_bytes: 16,
            ..UploadLimits::default()
        };
        let err = ingest_prescription_pdf(
            &fx.db_path,
            Arc::new(LopdfExtractor),
            &limits,
            upload(make_test_pdf(&["- sneezing (mild, 1d)"])),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::PayloadTooLarge { max_bytes: 16 }));
    }

    #[tokio::test]
    async fn media_type_parameters_are_accepted() {
        assert!(is_pdf_media_type(Some("Application/PDF; charset=binary")));
        assert!(!is_pdf_media_type(None));
        assert!(!is_pdf_media_type(Some("application/pdfx")));
    }

    #[tokio::test]
    async fn malformed_documents_have_distinct_messages() {
        let fx = fixture();
        let header = ingest(&fx, upload(b"not a pdf".to_vec())).await.unwrap_err();
        assert!(matches!(header, IngestError::MalformedDocument("Invalid PDF header")));

        let empty = ingest(&fx, upload(make_test_pdf(&[""]))).await.unwrap_err();
        assert!(matches!(
            empty,
            IngestError::MalformedDocument("PDF text-layer extraction returned empty text")
        ));

        let encrypted = ingest_prescription_pdf(
            &fx.db_path,
            Arc::new(EncryptedExtractor),
            &UploadLimits::default(),
            upload(make_test_pdf(&["x"])),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            encrypted,
            IngestError::MalformedDocument("Encrypted PDF files are not supported")
        ));
    }

    #[tokio::test]
    async fn slow_extraction_times_out() {
        let fx = fixture();
        let limits = UploadLimits {
            extract_timeout: Duration::from_millis(50),
            ..UploadLimits::default()
        };
        let err = ingest_prescription_pdf(
            &fx.db_path,
            Arc::new(SlowExtractor),
            &limits,
            upload(make_test_pdf(&["x"])),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::MalformedDocument("PDF extraction timed out")));
    }

    #[tokio::test]
    async fn unknown_patient_is_rejected_before_parsing() {
        let fx = fixture();
        let mut up = upload(make_test_pdf(&["- sneezing (mild, 1d)"]));
        up.patient_ref = "pt_999999".into();
        assert!(matches!(ingest(&fx, up).await, Err(IngestError::UnknownPatient)));
    }
}
