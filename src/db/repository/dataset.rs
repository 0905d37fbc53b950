//! Synthetic pharmacy dataset: patients, visits, pharmacy events,
//! inventory and uploaded-document metadata.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::like_prefix;
use crate::db::DatabaseError;
use crate::models::*;

// ═══════════════════════════════════════════
// Patients
// ═══════════════════════════════════════════

pub fn upsert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (patient_ref, created_at, llm_context_json) VALUES (?1, ?2, ?3)
         ON CONFLICT(patient_ref) DO UPDATE SET llm_context_json = excluded.llm_context_json",
        params![
            patient.patient_ref,
            patient.created_at,
            serde_json::to_string(&patient.llm_context)?,
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, patient_ref: &str) -> Result<Option<Patient>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT patient_ref, created_at, llm_context_json FROM patients WHERE patient_ref = ?1",
            params![patient_ref],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(patient_ref, created_at, ctx)| {
        Ok(Patient {
            patient_ref,
            created_at,
            llm_context: serde_json::from_str(&ctx)?,
        })
    })
    .transpose()
}

/// Patient listing without any free-text field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSummary {
    pub patient_ref: String,
    pub age_years: Option<u32>,
    pub sex: Option<String>,
    pub allergies_count: usize,
    pub conditions_count: usize,
    pub visit_count: usize,
}

/// Prefix search on `patient_ref`, ordered by ref.
pub fn search_patients(
    conn: &Connection,
    query: Option<&str>,
    limit: usize,
) -> Result<Vec<PatientSummary>, DatabaseError> {
    let pattern = like_prefix(query.unwrap_or(""));
    let mut stmt = conn.prepare(
        "SELECT p.patient_ref, p.llm_context_json,
                (SELECT COUNT(*) FROM visits v WHERE v.patient_ref = p.patient_ref)
         FROM patients p
         WHERE p.patient_ref LIKE ?1 ESCAPE '\\'
         ORDER BY p.patient_ref ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(patient_ref, ctx, visits)| {
            let ctx: PatientContext = serde_json::from_str(&ctx)?;
            Ok(PatientSummary {
                patient_ref,
                age_years: ctx.demographics.age_years,
                sex: ctx.demographics.sex,
                allergies_count: ctx.allergies.len(),
                conditions_count: ctx.conditions.len(),
                visit_count: visits.max(0) as usize,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════
// Visits & pharmacy events
// ═══════════════════════════════════════════

pub fn upsert_visit(conn: &Connection, visit: &Visit) -> Result<(), DatabaseError> {
    let intake = visit
        .intake_extracted
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO visits (visit_ref, patient_ref, occurred_at, primary_domain, source, intake_extracted_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(visit_ref) DO UPDATE SET
            occurred_at = excluded.occurred_at,
            primary_domain = excluded.primary_domain,
            source = excluded.source,
            intake_extracted_json = excluded.intake_extracted_json",
        params![
            visit.visit_ref,
            visit.patient_ref,
            visit.occurred_at,
            visit.primary_domain,
            visit.source,
            intake,
        ],
    )?;
    Ok(())
}

const VISIT_COLUMNS: &str =
    "visit_ref, patient_ref, occurred_at, primary_domain, source, intake_extracted_json";

fn visit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Visit, Option<String>)> {
    Ok((
        Visit {
            visit_ref: row.get(0)?,
            patient_ref: row.get(1)?,
            occurred_at: row.get(2)?,
            primary_domain: row.get(3)?,
            source: row.get(4)?,
            intake_extracted: None,
        },
        row.get(5)?,
    ))
}

fn attach_intake((mut visit, intake): (Visit, Option<String>)) -> Result<Visit, DatabaseError> {
    visit.intake_extracted = intake.as_deref().map(serde_json::from_str).transpose()?;
    Ok(visit)
}

pub fn get_visit(conn: &Connection, visit_ref: &str) -> Result<Option<Visit>, DatabaseError> {
    conn.query_row(
        &format!("SELECT {VISIT_COLUMNS} FROM visits WHERE visit_ref = ?1"),
        params![visit_ref],
        visit_from_row,
    )
    .optional()?
    .map(attach_intake)
    .transpose()
}

/// Newest first.
pub fn list_visits(conn: &Connection, patient_ref: &str) -> Result<Vec<Visit>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VISIT_COLUMNS} FROM visits WHERE patient_ref = ?1
         ORDER BY occurred_at DESC, visit_ref ASC"
    ))?;
    let rows = stmt
        .query_map(params![patient_ref], visit_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(attach_intake).collect()
}

pub fn latest_visit(conn: &Connection, patient_ref: &str) -> Result<Option<Visit>, DatabaseError> {
    conn.query_row(
        &format!(
            "SELECT {VISIT_COLUMNS} FROM visits WHERE patient_ref = ?1
             ORDER BY occurred_at DESC, visit_ref ASC LIMIT 1"
        ),
        params![patient_ref],
        visit_from_row,
    )
    .optional()?
    .map(attach_intake)
    .transpose()
}

/// Visit listing: structured fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitSummary {
    pub visit_ref: String,
    pub occurred_at: String,
    pub primary_domain: String,
    pub source: String,
    pub symptom_count: usize,
    pub red_flag_count: usize,
}

impl From<&Visit> for VisitSummary {
    fn from(visit: &Visit) -> Self {
        let (symptom_count, red_flag_count) = visit
            .intake_extracted
            .as_ref()
            .map(|i| (i.symptoms.len(), i.red_flags.len()))
            .unwrap_or((0, 0));
        Self {
            visit_ref: visit.visit_ref.clone(),
            occurred_at: visit.occurred_at.clone(),
            primary_domain: visit.primary_domain.clone(),
            source: visit.source.clone(),
            symptom_count,
            red_flag_count,
        }
    }
}

pub fn insert_pharmacy_event(
    conn: &Connection,
    event_ref: &str,
    patient_ref: &str,
    visit_ref: Option<&str>,
    occurred_at: &str,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO events (event_ref, patient_ref, visit_ref, occurred_at, kind, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event_ref,
            patient_ref,
            visit_ref,
            occurred_at,
            kind,
            serde_json::to_string(payload)?,
        ],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════
// Inventory
// ═══════════════════════════════════════════

pub fn upsert_product(conn: &Connection, product: &Product) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO inventory (sku, category, in_stock, stock_qty, price_eur, product_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(sku) DO UPDATE SET
            category = excluded.category,
            in_stock = excluded.in_stock,
            stock_qty = excluded.stock_qty,
            price_eur = excluded.price_eur,
            product_json = excluded.product_json",
        params![
            product.sku,
            product.category,
            product.in_stock,
            product.stock_qty,
            product.price_eur,
            serde_json::to_string(product)?,
        ],
    )?;
    Ok(())
}

pub fn list_products(conn: &Connection) -> Result<Vec<Product>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT product_json FROM inventory ORDER BY sku ASC")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|json| Ok(serde_json::from_str(json)?))
        .collect()
}

// ═══════════════════════════════════════════
// Documents (metadata only)
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_ref: String,
    pub patient_ref: Option<String>,
    pub created_at: String,
    pub status: String,
    pub sha256_12: String,
    pub page_count: usize,
    pub metadata: serde_json::Value,
}

pub fn insert_document(conn: &Connection, doc: &DocumentRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO documents (doc_ref, patient_ref, created_at, status, sha256_12, page_count, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            doc.doc_ref,
            doc.patient_ref,
            doc.created_at,
            doc.status,
            doc.sha256_12,
            doc.page_count as i64,
            serde_json::to_string(&doc.metadata)?,
        ],
    )?;
    Ok(())
}

pub fn get_document(conn: &Connection, doc_ref: &str) -> Result<Option<DocumentRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT doc_ref, patient_ref, created_at, status, sha256_12, page_count, metadata_json
             FROM documents WHERE doc_ref = ?1",
            params![doc_ref],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(
        |(doc_ref, patient_ref, created_at, status, sha256_12, page_count, metadata)| {
            Ok(DocumentRecord {
                doc_ref,
                patient_ref,
                created_at,
                status,
                sha256_12,
                page_count: page_count.max(0) as usize,
                metadata: serde_json::from_str(&metadata)?,
            })
        },
    )
    .transpose()
}

// ═══════════════════════════════════════════
// Demo seed
// ═══════════════════════════════════════════

const SEED_PATIENTS: &str = include_str!("../../../resources/dataset/patients.json");
const SEED_VISITS: &str = include_str!("../../../resources/dataset/visits.json");
const SEED_INVENTORY: &str = include_str!("../../../resources/dataset/inventory.json");

/// Row counts after seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub loaded: bool,
    pub patients: usize,
    pub visits: usize,
    pub inventory: usize,
}

fn count(conn: &Connection, table: &str) -> Result<usize, DatabaseError> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

/// Load the compiled-in synthetic dataset when the tables are empty.
pub fn seed_demo_dataset(conn: &Connection) -> Result<SeedReport, DatabaseError> {
    if count(conn, "patients")? > 0 && count(conn, "inventory")? > 0 {
        return Ok(SeedReport {
            loaded: false,
            patients: count(conn, "patients")?,
            visits: count(conn, "visits")?,
            inventory: count(conn, "inventory")?,
        });
    }

    let patients: Vec<Patient> = serde_json::from_str(SEED_PATIENTS)?;
    let visits: Vec<Visit> = serde_json::from_str(SEED_VISITS)?;
    let products: Vec<Product> = serde_json::from_str(SEED_INVENTORY)?;

    let tx = conn.unchecked_transaction()?;
    for patient in &patients {
        upsert_patient(&tx, patient)?;
    }
    for visit in &visits {
        upsert_visit(&tx, visit)?;
    }
    for product in &products {
        upsert_product(&tx, product)?;
    }
    tx.commit()?;

    tracing::info!(
        patients = patients.len(),
        visits = visits.len(),
        inventory = products.len(),
        "Seeded demo dataset"
    );

    Ok(SeedReport {
        loaded: true,
        patients: count(conn, "patients")?,
        visits: count(conn, "visits")?,
        inventory: count(conn, "inventory")?,
    })
}
