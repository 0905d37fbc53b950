//! Prescription document ingestion: PDF text layer, redaction, PHI
//! boundary, deterministic intake and visit creation.
//!
//! Raw document text never leaves this module: only lengths, hashes,
//! counts and the structured intake are persisted.

pub mod pdf;
pub mod prescription;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::models::Violation;

pub use pdf::{LopdfExtractor, PdfError, PdfText, PdfTextExtractor};
pub use prescription::{ingest_prescription_pdf, IngestReceipt, PrescriptionUpload};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Only application/pdf uploads are accepted")]
    UnsupportedMediaType,

    #[error("Upload exceeds {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: usize },

    #[error("{0}")]
    MalformedDocument(&'static str),

    #[error("Document rejected at the PHI boundary ({doc_ref})")]
    PhiRejected {
        doc_ref: String,
        violations: Vec<Violation>,
    },

    #[error("Unknown patient_ref")]
    UnknownPatient,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<PdfError> for IngestError {
    fn from(err: PdfError) -> Self {
        IngestError::MalformedDocument(err.public_message())
    }
}
