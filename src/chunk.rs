//! Boundary-aware sliding-window chunker.
//!
//! Splits each [`LoadedUnit`]'s text into [`ChunkDraft`]s of at most
//! `chunk_chars` bytes. A window ends at the last paragraph break inside it,
//! falling back to a line break, a sentence end, a space and finally a hard
//! cut on a UTF-8 character boundary. Consecutive windows overlap by up to
//! `overlap_chars` bytes, with the next window moved forward to a word start.
//!
//! Every chunk is an exact slice of its unit (`char_span` holds the byte
//! range), so the unit text is recovered by appending each chunk minus the
//! prefix it shares with its predecessor. See [`reconstruct`].

use crate::models::{CharSpan, ChunkDraft, LoadedUnit};

/// Break candidates, strongest first. The separator stays with the left chunk.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", " "];

/// Split every unit, carrying its page/slide and title onto each chunk.
pub fn split(units: &[LoadedUnit], chunk_chars: usize, overlap_chars: usize) -> Vec<ChunkDraft> {
    units
        .iter()
        .enumerate()
        .flat_map(|(unit_index, unit)| {
            split_spans(&unit.text, chunk_chars, overlap_chars)
                .into_iter()
                .map(move |span| ChunkDraft {
                    unit_index,
                    text: unit.text[span.start..span.end].to_string(),
                    page_or_slide: unit.page_or_slide,
                    title: unit.title.clone(),
                    char_span: span,
                })
        })
        .collect()
}

/// Byte spans of the windows covering `text`. Blank text yields no spans.
pub fn split_spans(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<CharSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let window = chunk_chars.max(1);
    // Leaves room for a 4-byte char so every window ends past its predecessor.
    let overlap = overlap_chars.min(window.saturating_sub(4));
    // A break must leave the window longer than the overlap, or the next
    // window would not extend past this one.
    let min_len = (window / 4).max(overlap + 1).min(window);

    let len = text.len();
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        if len - start <= window {
            spans.push(CharSpan { start, end: len });
            break;
        }
        let end = find_break(text, start, window, min_len);
        spans.push(CharSpan { start, end });

        let mut next = snap_to_word_start(text, end.saturating_sub(overlap), end);
        if next <= start {
            next = end;
        }
        start = next;
    }
    spans
}

/// Concatenate chunk texts of one unit, dropping the overlap of each chunk
/// with its predecessor.
pub fn reconstruct(chunks: &[ChunkDraft]) -> String {
    let mut out = String::new();
    let mut prev_end: usize = 0;
    for (i, c) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&c.text);
        } else {
            let shared = prev_end.saturating_sub(c.char_span.start);
            out.push_str(&c.text[shared.min(c.text.len())..]);
        }
        prev_end = c.char_span.end;
    }
    out
}

fn find_break(text: &str, start: usize, window: usize, min_len: usize) -> usize {
    let mut limit = floor_char_boundary(text, start + window);
    if limit <= start {
        // Window smaller than one character.
        limit = ceil_char_boundary(text, start + 1);
    }
    let region = &text[start..limit];
    for sep in SEPARATORS {
        if let Some(pos) = region.rfind(sep) {
            let end = start + pos + sep.len();
            if end - start >= min_len {
                return end;
            }
        }
    }
    limit
}

/// Move `pos` forward to the start of the next word, never past `limit`.
fn snap_to_word_start(text: &str, pos: usize, limit: usize) -> usize {
    let pos = ceil_char_boundary(text, pos);
    if pos == 0 || pos >= limit {
        return pos.min(limit);
    }
    let at_word_start = text[..pos]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
    if at_word_start {
        return pos;
    }
    let tail = &text[pos..limit];
    let Some(ws) = tail.find(char::is_whitespace) else {
        return pos;
    };
    match tail[ws..].find(|c: char| !c.is_whitespace()) {
        Some(off) => pos + ws + off,
        None => pos,
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
