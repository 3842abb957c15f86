use std::collections::BTreeMap;

use crate::error::IngestError;
use crate::models::{ImageRef, Page};

use super::{parse_error, ParseInput};

/// One page per PDF page. In vision mode the first JPEG (`DCTDecode`)
/// image on each page is attached to it.
pub(super) fn parse_pdf(input: &ParseInput<'_>) -> Result<Vec<Page>, IngestError> {
    let texts = pdf_extract::extract_text_from_mem_by_pages(input.bytes)
        .map_err(|e| parse_error(input.name, e))?;

    let mut images = if input.vision {
        page_images(input)?
    } else {
        BTreeMap::new()
    };

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let number = i as u32 + 1;
            let mut page = Page::new(number, clean_page_text(&raw));
            page.image = images.remove(&number);
            page
        })
        .collect())
}

/// Drop NULs, trim each line, and remove blank-line runs.
fn clean_page_text(raw: &str) -> String {
    raw.replace('\0', "")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn page_images(input: &ParseInput<'_>) -> Result<BTreeMap<u32, ImageRef>, IngestError> {
    let doc = lopdf::Document::load_mem(input.bytes).map_err(|e| parse_error(input.name, e))?;
    let mut images = BTreeMap::new();
    for (number, page_id) in doc.get_pages() {
        let Ok(page_images) = doc.get_page_images(page_id) else {
            continue;
        };
        let jpeg = page_images.into_iter().find(|img| {
            img.filters
                .as_ref()
                .map(|f| f.iter().any(|name| name == "DCTDecode"))
                .unwrap_or(false)
        });
        if let Some(img) = jpeg {
            images.insert(
                number,
                ImageRef::new(
                    format!("{}#page={}", input.name, number),
                    "image/jpeg",
                    img.content.to_vec(),
                ),
            );
        }
    }
    Ok(images)
}
