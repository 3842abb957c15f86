//! Office Open XML: DOCX (one page), PPTX (page per slide), XLSX (page per sheet).

use std::io::{Cursor, Read};

use quick_xml::events::Event;

use crate::error::IngestError;
use crate::models::Page;

use super::{number_pages, parse_error, ParseInput};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive<'a>(input: &ParseInput<'a>) -> Result<Archive<'a>, IngestError> {
    zip::ZipArchive::new(Cursor::new(input.bytes)).map_err(|e| parse_error(input.name, e))
}

fn read_entry(archive: &mut Archive<'_>, name: &str, item: &str) -> Result<Vec<u8>, IngestError> {
    let entry = archive.by_name(name).map_err(|e| parse_error(item, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| parse_error(item, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(parse_error(
            item,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(out)
}

/// Numbered entries like `ppt/slides/slide12.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate `<*:t>` text runs, breaking lines at each `paragraph` end tag.
fn text_runs(xml: &[u8], paragraph: &[u8], item: &str) -> Result<String, IngestError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == paragraph && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(item, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

pub(super) fn parse_docx(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let mut archive = open_archive(input)?;
    let xml = read_entry(&mut archive, "word/document.xml", input.name)?;
    let text = text_runs(&xml, b"p", input.name)?;
    Ok(number_pages(vec![(None, text)]))
}

pub(super) fn parse_pptx(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let mut archive = open_archive(input)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    let mut pages = Vec::with_capacity(slides.len());
    for name in slides {
        let xml = read_entry(&mut archive, &name, input.name)?;
        pages.push((None, text_runs(&xml, b"p", input.name)?));
    }
    Ok(number_pages(pages))
}

pub(super) fn parse_xlsx(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let mut archive = open_archive(input)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_entry(&mut archive, "xl/sharedStrings.xml", input.name)?;
        shared_strings(&xml, input.name)?
    } else {
        Vec::new()
    };

    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut pages = Vec::new();
    for name in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_entry(&mut archive, &name, input.name)?;
        pages.push((None, sheet_rows(&xml, &shared, input.name)?));
    }
    Ok(number_pages(pages))
}

fn shared_strings(xml: &[u8], item: &str) -> Result<Vec<String>, IngestError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(item, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per row, cells separated by tabs. Shared strings are resolved;
/// other cell values are taken literally.
fn sheet_rows(xml: &[u8], shared: &[String], item: &str) -> Result<String, IngestError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut shared_cell = false;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" | b"t" => in_v = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_v => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let resolved = if shared_cell {
                        value.parse::<usize>().ok().and_then(|i| shared.get(i)).cloned()
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(v) = resolved {
                        row.push(v);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_v = false,
                b"c" => shared_cell = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(item, e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
