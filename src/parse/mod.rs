//! Format parsers: raw item bytes to ordered [`Page`]s.
//!
//! A [`ParserRegistry`] maps each [`Format`] to a parse function. The
//! registry is built once per run from the pipeline options; vision mode
//! additionally registers standalone images and turns on PDF page-image
//! extraction.
//!
//! | Format | Paging |
//! |--------|--------|
//! | PDF | one page per PDF page |
//! | HTML, Markdown | one page per heading-delimited section |
//! | JSON | one page per top-level array element |
//! | Plain text | pages split on form feed |
//! | Image | one page, vision mode only |
//! | DOCX / PPTX / XLSX | one page / per slide / per sheet |
//!
//! Parsers are pure functions of the input bytes, so re-parsing yields
//! identical pages.

mod markup;
mod ooxml;
mod pdf;
mod text;

use std::collections::HashMap;

use crate::error::IngestError;
use crate::models::{Page, SourceItem};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Pdf,
    Html,
    Markdown,
    Json,
    PlainText,
    Image,
    Docx,
    Pptx,
    Xlsx,
}

impl Format {
    /// Map a MIME type (parameters ignored) to a format.
    pub fn from_content_type(content_type: &str) -> Option<Format> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let format = match base.as_str() {
            MIME_PDF => Format::Pdf,
            "text/html" | "application/xhtml+xml" => Format::Html,
            "text/markdown" | "text/x-markdown" => Format::Markdown,
            "application/json" => Format::Json,
            "image/png" | "image/jpeg" | "image/gif" | "image/webp" => Format::Image,
            MIME_DOCX => Format::Docx,
            MIME_PPTX => Format::Pptx,
            MIME_XLSX => Format::Xlsx,
            other if other.starts_with("text/") => Format::PlainText,
            _ => return None,
        };
        Some(format)
    }
}

/// What a parse function sees.
pub struct ParseInput<'a> {
    pub bytes: &'a [u8],
    pub name: &'a str,
    pub content_type: &'a str,
    pub vision: bool,
}

pub type ParseFn = fn(&ParseInput<'_>) -> Result<Vec<Page>, IngestError>;

pub struct ParserRegistry {
    parsers: HashMap<Format, ParseFn>,
    vision: bool,
}

impl ParserRegistry {
    /// Registry with every built-in parser. Images are only registered
    /// when `vision` is on; otherwise they are an unsupported format.
    pub fn new(vision: bool) -> Self {
        let mut registry = Self {
            parsers: HashMap::new(),
            vision,
        };
        registry.register(Format::Pdf, pdf::parse_pdf);
        registry.register(Format::Html, markup::parse_html);
        registry.register(Format::Markdown, markup::parse_markdown);
        registry.register(Format::Json, text::parse_json);
        registry.register(Format::PlainText, text::parse_plain);
        registry.register(Format::Docx, ooxml::parse_docx);
        registry.register(Format::Pptx, ooxml::parse_pptx);
        registry.register(Format::Xlsx, ooxml::parse_xlsx);
        if vision {
            registry.register(Format::Image, text::parse_image);
        }
        registry
    }

    pub fn register(&mut self, format: Format, parse: ParseFn) {
        self.parsers.insert(format, parse);
    }

    pub fn supports(&self, content_type: &str) -> bool {
        Format::from_content_type(content_type)
            .map(|f| self.parsers.contains_key(&f))
            .unwrap_or(false)
    }

    pub fn parse(&self, item: &SourceItem) -> Result<Vec<Page>, IngestError> {
        let parse = Format::from_content_type(&item.content_type)
            .and_then(|f| self.parsers.get(&f))
            .ok_or_else(|| IngestError::UnsupportedFormat {
                content_type: item.content_type.clone(),
            })?;

        parse(&ParseInput {
            bytes: &item.content,
            name: &item.name,
            content_type: &item.content_type,
            vision: self.vision,
        })
    }
}

pub(crate) fn parse_error(name: &str, err: impl std::fmt::Display) -> IngestError {
    IngestError::Parse(format!("{}: {}", name, err))
}

/// Decode bytes as UTF-8, replacing invalid sequences and dropping a BOM.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(text.as_ref());
    text.replace("\r\n", "\n")
}

/// Number pages 1..=n in order.
pub(crate) fn number_pages(texts: Vec<(Option<String>, String)>) -> Vec<Page> {
    texts
        .into_iter()
        .enumerate()
        .map(|(i, (heading, text))| {
            let mut page = Page::new(i as u32 + 1, text);
            page.heading = heading;
            page
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(name: &str, content_type: &str, bytes: &[u8]) -> SourceItem {
        SourceItem::new(format!("file:{}", name), name, bytes.to_vec(), content_type, Utc::now())
    }

    #[test]
    fn content_types_map_to_formats() {
        assert_eq!(Format::from_content_type("text/html; charset=utf-8"), Some(Format::Html));
        assert_eq!(Format::from_content_type("text/csv"), Some(Format::PlainText));
        assert_eq!(Format::from_content_type("IMAGE/PNG"), Some(Format::Image));
        assert_eq!(Format::from_content_type("application/zip"), None);
    }

    #[test]
    fn unsupported_type_is_an_item_error() {
        let registry = ParserRegistry::new(false);
        let err = registry
            .parse(&item("a.exe", "application/x-msdownload", b"MZ"))
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat { .. }));
    }

    #[test]
    fn images_need_vision() {
        let png = item("fig.png", "image/png", &[0x89, b'P', b'N', b'G']);
        assert!(!ParserRegistry::new(false).supports("image/png"));
        assert!(matches!(
            ParserRegistry::new(false).parse(&png),
            Err(IngestError::UnsupportedFormat { .. })
        ));

        let pages = ParserRegistry::new(true).parse(&png).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "fig.png");
        assert_eq!(pages[0].image.as_ref().map(|i| i.mime.as_str()), Some("image/png"));
    }

    #[test]
    fn reparsing_is_deterministic() {
        let registry = ParserRegistry::new(false);
        let md = item("a.md", "text/markdown", b"# One\nalpha\n\n## Two\nbeta\n");
        let a = registry.parse(&md).unwrap();
        let b = registry.parse(&md).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.heading, y.heading);
            assert_eq!(x.number, y.number);
        }
    }

    #[test]
    fn corrupt_pdf_is_a_parse_error() {
        let registry = ParserRegistry::new(false);
        let err = registry
            .parse(&item("bad.pdf", MIME_PDF, b"not a pdf"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }

    #[test]
    fn corrupt_docx_is_a_parse_error() {
        let registry = ParserRegistry::new(false);
        let err = registry
            .parse(&item("bad.docx", MIME_DOCX, b"not a zip"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }
}
