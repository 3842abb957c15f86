//! Overlapping, boundary-aware text chunker.
//!
//! Splits an item's parsed [`Page`]s into [`Chunk`]s no larger than
//! `max_size` units, where consecutive chunks share exactly `overlap` units.
//!
//! # Algorithm
//!
//! 1. Drop blank pages and concatenate the rest with a `\n\n` separator,
//!    remembering each page's character span.
//! 2. From `start`, the hard end is `start + max`. If that is not the end of
//!    the text, look for a break in the tolerance window just before it:
//!    paragraph (`\n\n`) beats sentence end (`. `, `! `, `? `) beats line
//!    break beats any whitespace. The latest break of the best class wins.
//!    With no break the chunk is cut at the size limit.
//! 3. The next chunk starts `overlap` units before the previous end.
//! 4. A chunk's page range is every page whose span it touches.
//!
//! Sizes are measured in Unicode scalar values. In token mode budgets are
//! converted with a 4 chars/token approximation.

use anyhow::bail;
use serde::Deserialize;

use crate::error::IngestError;
use crate::models::{sha256_hex, Chunk, ImageRef, Page, SourceItem};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Separator inserted between consecutive non-blank pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Unit in which `max_size`, `overlap`, and `boundary_tolerance` are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Chars,
    Tokens,
}

impl SizeUnit {
    fn to_chars(self, n: usize) -> usize {
        match self {
            SizeUnit::Chars => n,
            SizeUnit::Tokens => n * CHARS_PER_TOKEN,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeUnit::Chars => "chars",
            SizeUnit::Tokens => "tokens",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub max_size: usize,
    pub overlap: usize,
    pub unit: SizeUnit,
    /// How far before the size limit a preferred break may be taken.
    pub boundary_tolerance: usize,
}

impl ChunkParams {
    /// Params with the default tolerance of one fifth of `max_size`,
    /// clamped so every chunk still advances past the overlap.
    pub fn new(max_size: usize, overlap: usize, unit: SizeUnit) -> Self {
        let room = max_size.saturating_sub(overlap).saturating_sub(1);
        Self {
            max_size,
            overlap,
            unit,
            boundary_tolerance: (max_size / 5).min(room),
        }
    }

    pub fn with_tolerance(mut self, tolerance: usize) -> Self {
        self.boundary_tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size == 0 {
            bail!("chunking.max_size must be > 0");
        }
        if self.overlap >= self.max_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.max_size ({})",
                self.overlap,
                self.max_size
            );
        }
        if self.boundary_tolerance >= self.max_size - self.overlap {
            bail!(
                "chunking.boundary_tolerance ({}) must be smaller than max_size - overlap ({})",
                self.boundary_tolerance,
                self.max_size - self.overlap
            );
        }
        Ok(())
    }

    fn max_chars(&self) -> usize {
        self.unit.to_chars(self.max_size)
    }

    fn overlap_chars(&self) -> usize {
        self.unit.to_chars(self.overlap)
    }

    fn tolerance_chars(&self) -> usize {
        self.unit.to_chars(self.boundary_tolerance)
    }
}

/// Concatenate non-blank page texts the way the chunker sees them.
pub fn concatenate_pages(pages: &[Page]) -> String {
    pages
        .iter()
        .filter(|p| !p.is_blank())
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

/// Split an item's pages into chunks.
///
/// Each chunk inherits the item's id and ACL. Fails with
/// [`IngestError::Chunking`] when no page has extractable text.
pub fn chunk_pages(
    item: &SourceItem,
    pages: &[Page],
    params: &ChunkParams,
) -> Result<Vec<Chunk>, IngestError> {
    let kept: Vec<&Page> = pages.iter().filter(|p| !p.is_blank()).collect();
    if kept.is_empty() {
        return Err(IngestError::Chunking(format!(
            "{} produced {} page(s) with no text",
            item.id,
            pages.len()
        )));
    }

    let mut chars: Vec<char> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::with_capacity(kept.len());
    for (i, page) in kept.iter().enumerate() {
        if i > 0 {
            chars.extend(PAGE_SEPARATOR.chars());
        }
        let start = chars.len();
        chars.extend(page.text.chars());
        spans.push((start, chars.len()));
    }

    let bounds = split_bounds(
        &chars,
        params.max_chars(),
        params.overlap_chars(),
        params.tolerance_chars(),
    );

    let chunks = bounds
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let text: String = chars[start..end].iter().collect();
            let touched = touched_pages(&spans, start, end);
            let first = kept[touched[0]];
            let last = kept[touched[touched.len() - 1]];
            let image = touched.iter().find_map(|&j| kept[j].image.clone());
            let content_hash = content_hash(&text, image.as_ref());
            Chunk {
                item_id: item.id.clone(),
                index,
                text,
                page_start: first.number,
                page_end: last.number,
                heading: first.heading.clone(),
                image,
                acl: item.acl.clone(),
                content_hash,
            }
        })
        .collect();

    Ok(chunks)
}

/// Deterministic hash of a chunk's normalized content.
///
/// Whitespace runs collapse to one space and the ends are trimmed. An
/// attached image contributes its digest after a `0x1f` separator.
pub fn content_hash(text: &str, image: Option<&ImageRef>) -> String {
    let mut normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(image) = image {
        normalized.push('\u{1f}');
        normalized.push_str(&image.digest);
    }
    sha256_hex(normalized.as_bytes())
}

/// Compute `[start, end)` character bounds for every chunk.
fn split_bounds(
    chars: &[char],
    max: usize,
    overlap: usize,
    tolerance: usize,
) -> Vec<(usize, usize)> {
    let n = chars.len();
    let mut bounds = Vec::new();
    let mut start = 0;

    while start < n {
        let hard_end = (start + max).min(n);
        let end = if hard_end == n {
            n
        } else {
            let floor = hard_end.saturating_sub(tolerance).max(start + overlap + 1);
            find_break(chars, floor, hard_end).unwrap_or(hard_end)
        };
        bounds.push((start, end));
        if end == n {
            break;
        }
        // end > start + overlap, so this always advances.
        start = end - overlap;
    }

    bounds
}

/// Latest, highest-priority break position in `[floor, hard_end]`.
///
/// A position `p` is an exclusive chunk end: the break characters stay
/// with the chunk being closed.
fn find_break(chars: &[char], floor: usize, hard_end: usize) -> Option<usize> {
    if floor == 0 || floor > hard_end {
        return None;
    }
    let mut best: [Option<usize>; 4] = [None; 4];
    for p in (floor..=hard_end).rev() {
        let prev = chars[p - 1];
        let prev2 = if p >= 2 { Some(chars[p - 2]) } else { None };
        if best[0].is_none() && prev == '\n' && prev2 == Some('\n') {
            best[0] = Some(p);
        }
        if best[1].is_none()
            && prev.is_whitespace()
            && matches!(prev2, Some('.') | Some('!') | Some('?'))
        {
            best[1] = Some(p);
        }
        if best[2].is_none() && prev == '\n' {
            best[2] = Some(p);
        }
        if best[3].is_none() && prev.is_whitespace() {
            best[3] = Some(p);
        }
        if best[0].is_some() {
            break;
        }
    }
    best.into_iter().flatten().next()
}

/// Indices of the pages whose spans intersect `[start, end)`.
fn touched_pages(spans: &[(usize, usize)], start: usize, end: usize) -> Vec<usize> {
    let touched: Vec<usize> = spans
        .iter()
        .enumerate()
        .filter(|(_, (s, e))| *s < end && *e > start)
        .map(|(j, _)| j)
        .collect();
    if !touched.is_empty() {
        return touched;
    }
    // Entirely inside a separator: attribute to the preceding page.
    let preceding = spans
        .iter()
        .rposition(|(_, e)| *e <= start)
        .unwrap_or(0);
    vec![preceding]
}
