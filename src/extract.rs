//! Multi-format text extraction for knowledge items.
//!
//! Items with inline content return it verbatim. Uploaded files are
//! dispatched on a closed set of source kinds derived from the file
//! extension: `.txt` (UTF-8), `.pdf` (per-page text, newline-joined),
//! `.docx` (paragraph text, newline-joined). Unknown extensions and
//! unreadable files degrade to sentinel strings instead of errors, so a
//! single bad upload can never take down the pipeline — the item later
//! surfaces as an `error` status when the sentinel fails to embed
//! usefully, and nothing propagates to the caller.

use std::io::Read;
use std::path::Path;

use crate::models::{ItemContent, KnowledgeItem};

/// Maximum decompressed bytes to read from a single ZIP entry
/// (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// The closed set of supported upload formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    PlainText,
    Pdf,
    Docx,
    Unsupported(String),
}

impl SourceKind {
    /// Classify a file by its extension (case-insensitive). `.doc` is
    /// accepted alongside `.docx`, matching what tenants actually upload.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "txt" => SourceKind::PlainText,
            "pdf" => SourceKind::Pdf,
            "docx" | "doc" => SourceKind::Docx,
            other => SourceKind::Unsupported(other.to_string()),
        }
    }
}

/// Extraction failure, internal to this module. Public callers only ever
/// see sentinel strings.
#[derive(Debug)]
enum ExtractError {
    Io(String),
    Pdf(String),
    Ooxml(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Io(e) => write!(f, "read failed: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
        }
    }
}

/// Extract the raw text of a knowledge item.
///
/// Inline content is returned verbatim; uploads go through
/// [`extract_file`]. Never fails.
pub fn extract_item(item: &KnowledgeItem) -> String {
    match &item.content {
        ItemContent::Inline(text) => text.clone(),
        ItemContent::Upload(path) => extract_file(path),
    }
}

/// Extract plain text from an uploaded document, degrading to a sentinel
/// string on unsupported types or corrupt files.
pub fn extract_file(path: &Path) -> String {
    let result = match SourceKind::from_path(path) {
        SourceKind::PlainText => extract_txt(path),
        SourceKind::Pdf => extract_pdf(path),
        SourceKind::Docx => extract_docx(path),
        SourceKind::Unsupported(ext) => {
            return format!("Unsupported file type: {}", ext);
        }
    };

    match result {
        Ok(text) => text,
        Err(e) => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload");
            tracing::warn!("error extracting {}: {}", path.display(), e);
            format!("Error processing file: {}", name)
        }
    }
}

fn extract_txt(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path).map_err(|e| ExtractError::Io(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExtractError::Io(e.to_string()))
}

fn extract_pdf(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path).map_err(|e| ExtractError::Io(e.to_string()))?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path).map_err(|e| ExtractError::Io(e.to_string()))?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_paragraph_text(&doc_xml)
}

/// Walk `word/document.xml`, collecting `w:t` text runs and inserting a
/// newline at the end of each `w:p` paragraph.
fn extract_paragraph_text(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == b"p" {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assistant, LanguagePref};

    fn assistant() -> Assistant {
        Assistant {
            id: "a1".to_string(),
            owner_id: "u1".to_string(),
            business_type: "Retail".to_string(),
            preferred_language: LanguagePref::Auto,
        }
    }

    #[test]
    fn inline_content_returned_verbatim() {
        let item = KnowledgeItem::new_inline(&assistant(), "Hours", "We open 9-5.");
        assert_eq!(extract_item(&item), "We open 9-5.");
    }

    #[test]
    fn classifies_extensions() {
        assert_eq!(
            SourceKind::from_path(Path::new("a/notes.TXT")),
            SourceKind::PlainText
        );
        assert_eq!(SourceKind::from_path(Path::new("b.pdf")), SourceKind::Pdf);
        assert_eq!(SourceKind::from_path(Path::new("c.docx")), SourceKind::Docx);
        assert_eq!(SourceKind::from_path(Path::new("c.doc")), SourceKind::Docx);
        assert_eq!(
            SourceKind::from_path(Path::new("d.csv")),
            SourceKind::Unsupported("csv".to_string())
        );
    }

    #[test]
    fn unsupported_extension_yields_sentinel() {
        let text = extract_file(Path::new("/nonexistent/data.csv"));
        assert_eq!(text, "Unsupported file type: csv");
    }

    #[test]
    fn missing_txt_yields_error_sentinel() {
        let text = extract_file(Path::new("/nonexistent/notes.txt"));
        assert_eq!(text, "Error processing file: notes.txt");
    }

    #[test]
    fn corrupt_pdf_yields_error_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        assert_eq!(extract_file(&path), "Error processing file: broken.pdf");
    }

    #[test]
    fn corrupt_docx_yields_error_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip").unwrap();
        assert_eq!(extract_file(&path), "Error processing file: broken.docx");
    }

    #[test]
    fn docx_paragraphs_joined_by_newlines() {
        let xml = br#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second </w:t></w:r><w:r><w:t>paragraph.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let text = extract_paragraph_text(xml).unwrap();
        assert_eq!(text, "First paragraph.\nSecond paragraph.\n");
    }
}
