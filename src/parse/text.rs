use serde_json::Value;

use crate::error::IngestError;
use crate::models::{ImageRef, Page};

use super::{decode_text, number_pages, parse_error, ParseInput};

/// Form feed separates pages in plain text.
const PAGE_BREAK: char = '\x0c';

pub(super) fn parse_plain(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let text = decode_text(input.bytes);
    Ok(number_pages(
        text.split(PAGE_BREAK)
            .map(|page| (None, page.to_string()))
            .collect(),
    ))
}

/// One page per top-level array element, otherwise one page.
///
/// Each page lists the leaves as `path: value` lines in document order.
pub(super) fn parse_json(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let value: Value =
        serde_json::from_slice(input.bytes).map_err(|e| parse_error(input.name, e))?;

    let sections = match &value {
        Value::Array(items) => items.iter().map(render).collect(),
        other => vec![render(other)],
    };
    Ok(number_pages(sections.into_iter().map(|t| (None, t)).collect()))
}

pub(super) fn parse_image(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    if input.bytes.is_empty() {
        return Err(parse_error(input.name, "empty image"));
    }
    let mut page = Page::new(1, input.name);
    page.image = Some(ImageRef::new(
        input.name,
        input.content_type,
        input.bytes.to_vec(),
    ));
    Ok(vec![page])
}

fn render(value: &Value) -> String {
    let mut lines = Vec::new();
    flatten(value, "", &mut lines);
    lines.join("\n")
}

fn flatten(value: &Value, path: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten(child, &child_path, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten(child, &format!("{}[{}]", path, i), out);
            }
        }
        Value::String(s) => out.push(leaf(path, s)),
        other => out.push(leaf(path, &other.to_string())),
    }
}

fn leaf(path: &str, value: &str) -> String {
    if path.is_empty() {
        value.to_string()
    } else {
        format!("{}: {}", path, value)
    }
}
