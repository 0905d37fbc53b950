use thiserror::Error;

/// Text layer of a PDF, pages joined in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfText {
    pub text: String,
    pub page_count: usize,
}

/// Extraction failures. Messages are fixed strings and never quote the
/// document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PdfError {
    #[error("Invalid PDF header")]
    InvalidHeader,
    #[error("Invalid or unreadable PDF payload")]
    Unreadable,
    #[error("Encrypted PDF files are not supported")]
    Encrypted,
    #[error("PDF has too many pages (max {max})")]
    TooManyPages { pages: usize, max: usize },
}

impl PdfError {
    /// Client-facing message, free of any document content.
    pub fn public_message(&self) -> &'static str {
        match self {
            PdfError::InvalidHeader => "Invalid PDF header",
            PdfError::Unreadable => "Invalid or unreadable PDF payload",
            PdfError::Encrypted => "Encrypted PDF files are not supported",
            PdfError::TooManyPages { .. } => "PDF has too many pages",
        }
    }
}

/// Text-layer extraction seam. Implementations are synchronous and are
/// driven from a blocking thread.
pub trait PdfTextExtractor: Send + Sync {
    fn extract(&self, pdf_bytes: &[u8], max_pages: usize) -> Result<PdfText, PdfError>;
}

/// Extractor backed by `lopdf`. Handles digital PDFs with an embedded
/// text layer; scanned images yield empty text.
pub struct LopdfExtractor;

impl PdfTextExtractor for LopdfExtractor {
    fn extract(&self, pdf_bytes: &[u8], max_pages: usize) -> Result<PdfText, PdfError> {
        if !pdf_bytes.starts_with(b"%PDF-") {
            return Err(PdfError::InvalidHeader);
        }
        let doc = lopdf::Document::load_mem(pdf_bytes).map_err(|_| PdfError::Unreadable)?;
        if doc.is_encrypted() {
            return Err(PdfError::Encrypted);
        }

        let pages = doc.get_pages();
        let page_count = pages.len();
        if page_count > max_pages {
            return Err(PdfError::TooManyPages {
                pages: page_count,
                max: max_pages,
            });
        }

        let mut chunks = Vec::new();
        for number in pages.keys() {
            // A page without a decodable text layer contributes nothing.
            let Ok(text) = doc.extract_text(&[*number]) else {
                continue;
            };
            let text = text.trim();
            if !text.is_empty() {
                chunks.push(text.to_string());
            }
        }

        Ok(PdfText {
            text: chunks.join("\n").trim().to_string(),
            page_count,
        })
    }
}

/// Minimal text PDFs for tests: one page per entry, one `BT … ET` block
/// per line so the extractor sees line breaks.
#[cfg(test)]
pub(crate) fn make_test_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::dictionary;
    use lopdf::{Document, Object, Stream};

    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let pages_id = doc.new_object_id();

    let mut kids = Vec::new();
    for page_text in pages {
        let mut content = String::new();
        for (i, line) in page_text.lines().enumerate() {
            let escaped = line
                .replace('\\', "\\\\")
                .replace('(', "\\(")
                .replace(')', "\\)");
            let y = 700 - 20 * i as i64;
            content.push_str(&format!("BT /F1 12 Tf 72 {y} Td ({escaped}) Tj ET\n"));
        }
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        kids.push(Object::from(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}
