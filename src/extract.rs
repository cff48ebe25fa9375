//! Document loader: turns an uploaded file into location-tagged text units.
//!
//! | Type | Unit | `page_or_slide` | `title` |
//! |------|------|-----------------|---------|
//! | pdf  | one per page (empty pages kept) | page number | first non-empty line |
//! | pptx | one per slide | slide number | title placeholder, else first line |
//! | docx | one per heading section | none | heading text |
//! | txt  | one per markdown `#` section, else whole file | none | heading text |
//! | csv  | one per group of rows | none | `rows a-b` |
//!
//! Loading never touches the disk. Parse failures are reported as
//! [`AssistantError::Extraction`] so the caller can skip the file and carry on.

use std::io::Read;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{AssistantError, Result};
use crate::models::{FileType, LoadedUnit};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Upper bound on slides read from one deck.
const MAX_SLIDES: usize = 2_000;
const MAX_TITLE_CHARS: usize = 120;

/// Load `bytes`, detecting the type from `file_name`.
pub fn load(file_name: &str, bytes: &[u8], csv_rows_per_unit: usize) -> Result<Vec<LoadedUnit>> {
    let file_type = FileType::from_file_name(file_name)?;
    load_as(file_type, file_name, bytes, csv_rows_per_unit)
}

/// Load `bytes` as a known type. Fails when no unit carries any text.
pub fn load_as(
    file_type: FileType,
    file_name: &str,
    bytes: &[u8],
    csv_rows_per_unit: usize,
) -> Result<Vec<LoadedUnit>> {
    let units = match file_type {
        FileType::Pdf => load_pdf(bytes),
        FileType::Pptx => load_pptx(bytes),
        FileType::Docx => load_docx(bytes),
        FileType::Txt => Ok(load_txt(&String::from_utf8_lossy(bytes))),
        FileType::Csv => load_csv(bytes, csv_rows_per_unit.max(1)),
    }
    .map_err(|message| AssistantError::Extraction {
        file: file_name.to_string(),
        message,
    })?;

    if units.iter().all(|u| u.text.trim().is_empty()) {
        return Err(AssistantError::Extraction {
            file: file_name.to_string(),
            message: "no extractable text".to_string(),
        });
    }
    Ok(units)
}

fn load_pdf(bytes: &[u8]) -> std::result::Result<Vec<LoadedUnit>, String> {
    // pdf-extract panics on some malformed inputs.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| "PDF parser panicked".to_string())?
        .map_err(|e| format!("PDF extraction failed: {e}"))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let text = normalize_block(&raw);
            LoadedUnit {
                title: first_line_title(&text),
                text,
                page_or_slide: Some(i as u32 + 1),
            }
        })
        .collect())
}

fn open_archive(bytes: &[u8]) -> std::result::Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, String> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| format!("not an OOXML package: {e}"))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{name}: {e}"))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{name}: {e}"))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {name} exceeds size limit ({MAX_XML_ENTRY_BYTES} bytes)"
        ));
    }
    Ok(out)
}

fn load_pptx(bytes: &[u8]) -> std::result::Result<Vec<LoadedUnit>, String> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .filter_map(|n| {
            n.trim_start_matches("ppt/slides/slide")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .ok()
                .map(|num| (num, n.to_string()))
        })
        .collect();
    if slides.is_empty() {
        return Err("no slides found in ppt/slides/".to_string());
    }
    slides.sort_by_key(|(num, _)| *num);

    let mut units = Vec::with_capacity(slides.len());
    for (position, (_, name)) in slides.into_iter().take(MAX_SLIDES).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let (text, title) = parse_slide(&xml).map_err(|e| format!("{name}: {e}"))?;
        units.push(LoadedUnit {
            title: title.or_else(|| first_line_title(&text)),
            text,
            page_or_slide: Some(position as u32 + 1),
        });
    }
    Ok(units)
}

/// Returns the slide text (one line per `a:p`) and the title placeholder text.
fn parse_slide(xml: &[u8]) -> std::result::Result<(String, Option<String>), quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut title = String::new();
    let mut in_title_shape = false;
    let mut in_t = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let opening = matches!(event, Event::Start(_));
        match event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"sp" => in_title_shape = false,
                b"ph" => {
                    let is_title = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"type"
                            && matches!(a.value.as_ref(), b"title" | b"ctrTitle")
                    });
                    if is_title {
                        in_title_shape = true;
                    }
                }
                b"t" => in_t = opening,
                _ => {}
            },
            Event::Text(te) if in_t => {
                let s = te.unescape().unwrap_or_default();
                text.push_str(&s);
                if in_title_shape {
                    title.push_str(&s);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    if in_title_shape && !title.is_empty() && !title.ends_with(' ') {
                        title.push(' ');
                    }
                }
                b"sp" => in_title_shape = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let title = title.trim();
    let title = (!title.is_empty()).then(|| truncate_title(title));
    Ok((text.trim_end().to_string(), title))
}

fn load_docx(bytes: &[u8]) -> std::result::Result<Vec<LoadedUnit>, String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    parse_docx_sections(&xml).map_err(|e| format!("word/document.xml: {e}"))
}

fn is_heading_style(style: &str) -> bool {
    style.starts_with("Heading") || style == "Title"
}

/// Split `w:body` into sections at heading-styled paragraphs.
fn parse_docx_sections(xml: &[u8]) -> std::result::Result<Vec<LoadedUnit>, quick_xml::Error> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut sections: Vec<LoadedUnit> = Vec::new();
    let mut current = LoadedUnit {
        text: String::new(),
        page_or_slide: None,
        title: None,
    };
    let mut para = String::new();
    let mut style: Option<String> = None;
    let mut in_t = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let opening = matches!(event, Event::Start(_));
        match event {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"p" => {
                    para.clear();
                    style = None;
                }
                b"pStyle" => {
                    style = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"val")
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
                }
                b"t" => in_t = opening,
                b"tab" => para.push('\t'),
                b"br" | b"cr" => para.push('\n'),
                _ => {}
            },
            Event::Text(te) if in_t => para.push_str(&te.unescape().unwrap_or_default()),
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    let line = para.trim_end();
                    let heading = style.as_deref().is_some_and(is_heading_style);
                    if heading && !line.trim().is_empty() {
                        push_section(&mut sections, std::mem::replace(
                            &mut current,
                            LoadedUnit {
                                text: String::new(),
                                page_or_slide: None,
                                title: Some(truncate_title(line.trim())),
                            },
                        ));
                    }
                    current.text.push_str(line);
                    current.text.push('\n');
                    para.clear();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    push_section(&mut sections, current);
    Ok(sections)
}

fn push_section(sections: &mut Vec<LoadedUnit>, mut unit: LoadedUnit) {
    unit.text = normalize_block(&unit.text);
    if !unit.text.is_empty() {
        sections.push(unit);
    }
}

/// Markdown-style ATX heading: 1–6 `#` then a space.
fn txt_heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
    if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
        Some(trimmed[hashes..].trim())
    } else {
        None
    }
}

fn load_txt(text: &str) -> Vec<LoadedUnit> {
    let mut sections = Vec::new();
    let mut current = LoadedUnit {
        text: String::new(),
        page_or_slide: None,
        title: None,
    };
    for line in text.lines() {
        if let Some(heading) = txt_heading(line).filter(|h| !h.is_empty()) {
            let next = LoadedUnit {
                text: String::new(),
                page_or_slide: None,
                title: Some(truncate_title(heading)),
            };
            push_section(&mut sections, std::mem::replace(&mut current, next));
        }
        current.text.push_str(line);
        current.text.push('\n');
    }
    push_section(&mut sections, current);
    sections
}

fn load_csv(bytes: &[u8], rows_per_unit: usize) -> std::result::Result<Vec<LoadedUnit>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("CSV header: {e}"))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rendered = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("CSV row {}: {e}", i + 1))?;
        let line = record
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(col, v)| {
                let name = headers
                    .get(col)
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column {}", col + 1));
                format!("{name}: {}", v.trim())
            })
            .collect::<Vec<_>>()
            .join("\n");
        rendered.push(line);
    }

    Ok(rendered
        .chunks(rows_per_unit)
        .enumerate()
        .map(|(group, rows)| {
            let first = group * rows_per_unit + 1;
            let last = first + rows.len() - 1;
            LoadedUnit {
                text: rows.join("\n\n"),
                page_or_slide: None,
                title: Some(format!("rows {first}-{last}")),
            }
        })
        .filter(|u| !u.text.trim().is_empty())
        .collect())
}

/// Trim each line's trailing whitespace and collapse runs of blank lines.
fn normalize_block(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        out.push_str(line);
    }
    out
}

fn first_line_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(truncate_title)
}

fn truncate_title(s: &str) -> String {
    match s.char_indices().nth(MAX_TITLE_CHARS) {
        Some((idx, _)) => s[..idx].trim_end().to_string(),
        None => s.to_string(),
    }
}
