//! PHI boundary: structural scanner, free-text boundary and redaction.

pub mod boundary;
pub mod redact;
pub mod scanner;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::Violation;

pub use boundary::{raise_if_phi, scan_text};
pub use redact::{redact_phi_text, Redaction};
pub use scanner::{scan_artifact, scan_str, scan_value};

/// BLOCKER findings on untrusted text. Display lists codes only.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("PHI boundary violation: {}", codes(.violations))]
pub struct PhiBoundaryError {
    pub violations: Vec<Violation>,
}

fn codes(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// First 12 hex chars of the SHA-256 digest.
pub fn sha256_12(bytes: &[u8]) -> String {
    let mut hex = format!("{:x}", Sha256::digest(bytes));
    hex.truncate(12);
    hex
}
