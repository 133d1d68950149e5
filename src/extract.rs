//! Raw text extraction used to sanity-check uploads before they are sent to
//! the provider. Native PDF text comes from pdfium; scanned documents fall
//! back to `ocrmypdf`.

use std::{
    fs,
    io::{ErrorKind, Write},
    process::Command,
};

use pdfium_render::prelude::*;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::normalize::DocumentKind;

const MIN_TEXT_LENGTH: usize = 50;
const PAGE_BREAK: char = '\x0c';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub pages: Vec<String>,
    pub full_text: String,
}

impl ExtractedText {
    pub fn from_pages(pages: Vec<String>) -> Self {
        let full_text = pages.join("\n");
        Self { pages, full_text }
    }

    fn meaningful(&self) -> bool {
        self.full_text.trim().chars().count() >= MIN_TEXT_LENGTH
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The bytes are not a document any engine can open.
    #[error("unreadable document: {0}")]
    Unreadable(String),
    #[error("no text could be extracted")]
    NoText,
    #[error("text extraction engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// Blocking; call from `spawn_blocking`.
pub trait TextExtractor: Send + Sync + 'static {
    fn extract_text(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
        if !bytes.starts_with(b"%PDF") {
            return Err(ExtractError::Unreadable("missing PDF header".into()));
        }

        let native = match extract_pdf_pages(bytes) {
            Ok(text) if text.meaningful() => return Ok(text),
            Ok(text) => Some(text),
            Err(err @ ExtractError::Unreadable(_)) => return Err(err),
            Err(err) => {
                debug!(error = %err, "native pdf text unavailable; trying ocr");
                None
            }
        };

        match run_ocr(bytes) {
            Ok(text) if text.meaningful() => Ok(text),
            Ok(_) => Err(ExtractError::NoText),
            Err(ExtractError::EngineUnavailable(reason)) => match native {
                Some(text) if !text.full_text.trim().is_empty() => Ok(text),
                Some(_) => Err(ExtractError::NoText),
                None => Err(ExtractError::EngineUnavailable(reason)),
            },
            Err(err) => Err(err),
        }
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|err| ExtractError::EngineUnavailable(format!("pdfium: {err}")))?;
    let pdfium = Pdfium::new(bindings);
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| ExtractError::Unreadable(format!("load pdf: {err}")))?;

    let mut pages = Vec::new();
    for page in document.pages().iter() {
        let mut combined = String::new();
        if let Ok(page_text) = page.text() {
            for segment in page_text.segments().iter() {
                combined.push_str(&segment.text());
                combined.push('\n');
            }
        }
        pages.push(combined);
    }

    Ok(ExtractedText::from_pages(pages))
}

fn run_ocr(bytes: &[u8]) -> Result<ExtractedText, ExtractError> {
    let failed = |err: std::io::Error| ExtractError::EngineUnavailable(err.to_string());

    let mut input = NamedTempFile::new().map_err(failed)?;
    input.write_all(bytes).map_err(failed)?;
    input.flush().map_err(failed)?;
    let output_pdf = NamedTempFile::new().map_err(failed)?;
    let sidecar = NamedTempFile::new().map_err(failed)?;

    let output = Command::new("ocrmypdf")
        .arg("--sidecar")
        .arg(sidecar.path())
        .arg("--skip-text")
        .arg(input.path())
        .arg(output_pdf.path())
        .output()
        .map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ExtractError::EngineUnavailable("ocrmypdf binary not found".into())
            } else {
                ExtractError::EngineUnavailable(err.to_string())
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, %stderr, "ocrmypdf failed");
        // ocrmypdf exits 2 for input it cannot parse as a PDF.
        return Err(if output.status.code() == Some(2) {
            ExtractError::Unreadable(stderr.into_owned())
        } else {
            ExtractError::EngineUnavailable(format!("ocrmypdf exit {}", output.status))
        });
    }

    let text = fs::read_to_string(sidecar.path()).map_err(failed)?;
    Ok(split_sidecar(&text))
}

/// The OCR sidecar separates pages with form feeds.
fn split_sidecar(text: &str) -> ExtractedText {
    let pages = text
        .split(PAGE_BREAK)
        .map(str::to_string)
        .filter(|page| !page.trim().is_empty())
        .collect();
    ExtractedText::from_pages(pages)
}

pub fn document_is_pdf(content_type: Option<&str>, original_name: &str) -> bool {
    if let Some(content_type) = content_type {
        if content_type.eq_ignore_ascii_case("application/pdf") {
            return true;
        }
    }

    mime_guess::from_path(original_name)
        .first()
        .map(|mime| mime.essence_str() == "application/pdf")
        .unwrap_or(false)
}

const PAYSLIP_KEYWORDS: &[&str] = &[
    "payslip",
    "pay slip",
    "net pay",
    "gross pay",
    "tax code",
    "ni number",
    "national insurance",
    "paye",
    "employee",
];

const STATEMENT_KEYWORDS: &[&str] = &[
    "statement",
    "opening balance",
    "closing balance",
    "sort code",
    "account number",
    "money in",
    "money out",
    "balance brought forward",
    "transactions",
];

/// Keyword vote between the two supported document kinds. Ties and documents
/// matching neither list stay unclassified.
pub fn classify_text(text: &str) -> Option<DocumentKind> {
    let lowered = text.to_lowercase();
    let score = |keywords: &[&str]| keywords.iter().filter(|kw| lowered.contains(*kw)).count();

    let payslip = score(PAYSLIP_KEYWORDS);
    let statement = score(STATEMENT_KEYWORDS);
    match payslip.cmp(&statement) {
        std::cmp::Ordering::Greater => Some(DocumentKind::Payslip),
        std::cmp::Ordering::Less => Some(DocumentKind::BankStatement),
        std::cmp::Ordering::Equal => None,
    }
}
