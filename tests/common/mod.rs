//! Shared fixtures and test doubles for the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ellie::config::Config;
use ellie::embedding::HashEmbedder;
use ellie::error::{AssistantError, Result};
use ellie::generation::{Generator, Prompt};
use ellie::models::ImageInput;
use ellie::registry::CourseRegistry;
use ellie::web_search::{WebSearch, WebSnippet};
use ellie::Assistant;

/// Minimal PDF with one text line per page. Offsets in the xref table are
/// computed so pdf-extract can parse it.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let n = pages.len();
    let font_id = 3;
    let page_id = |i: usize| 4 + 2 * i;
    let content_id = |i: usize| 5 + 2 * i;
    let total = 3 + 2 * n;

    let mut out = Vec::new();
    let mut offsets = vec![0usize; total + 1];
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets[1] = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    offsets[2] = out.len();
    let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", page_id(i))).collect();
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            n
        )
        .as_bytes(),
    );

    offsets[font_id] = out.len();
    out.extend_from_slice(
        b"3 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );

    for (i, text) in pages.iter().enumerate() {
        offsets[page_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R \
                 /Resources << /Font << /F1 {} 0 R >> >> >> endobj\n",
                page_id(i),
                content_id(i),
                font_id
            )
            .as_bytes(),
        );
        let stream = format!("BT /F1 12 Tf 72 700 Td ({}) Tj ET", text);
        offsets[content_id(i)] = out.len();
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
                content_id(i),
                stream.len(),
                stream
            )
            .as_bytes(),
        );
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", total + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets.iter().skip(1) {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            total + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}

fn zip_entries(entries: &[(String, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(name.as_str(), zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// DOCX whose paragraphs are `(style, text)`; use `Some("Heading1")` for headings.
pub fn docx(paragraphs: &[(Option<&str>, &str)]) -> Vec<u8> {
    let mut body = String::new();
    for (style, text) in paragraphs {
        body.push_str("<w:p>");
        if let Some(style) = style {
            body.push_str(&format!("<w:pPr><w:pStyle w:val=\"{style}\"/></w:pPr>"));
        }
        body.push_str(&format!("<w:r><w:t>{text}</w:t></w:r></w:p>"));
    }
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{body}</w:body></w:document>"
    );
    zip_entries(&[("word/document.xml".to_string(), xml)])
}

/// PPTX with one slide per `(title, body lines)`.
pub fn pptx(slides: &[(&str, &[&str])]) -> Vec<u8> {
    let entries: Vec<(String, String)> = slides
        .iter()
        .enumerate()
        .map(|(i, (title, lines))| {
            let paras: String = lines
                .iter()
                .map(|l| format!("<a:p><a:r><a:t>{l}</a:t></a:r></a:p>"))
                .collect();
            let xml = format!(
                "<?xml version=\"1.0\"?>\
                 <p:sld xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\" \
                 xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\">\
                 <p:cSld><p:spTree>\
                 <p:sp><p:nvSpPr><p:cNvPr id=\"2\" name=\"Title\"/><p:cNvSpPr/><p:nvPr><p:ph type=\"title\"/></p:nvPr></p:nvSpPr>\
                 <p:txBody><a:p><a:r><a:t>{title}</a:t></a:r></a:p></p:txBody></p:sp>\
                 <p:sp><p:nvSpPr><p:cNvPr id=\"3\" name=\"Body\"/><p:cNvSpPr/><p:nvPr/></p:nvSpPr>\
                 <p:txBody>{paras}</p:txBody></p:sp>\
                 </p:spTree></p:cSld></p:sld>"
            );
            (format!("ppt/slides/slide{}.xml", i + 1), xml)
        })
        .collect();
    zip_entries(&entries)
}

/// Generator double: replies with a fixed text (or fails) and records prompts.
pub struct ScriptedGenerator {
    reply: Option<String>,
    pub calls: AtomicUsize,
    pub images: AtomicUsize,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(text.to_string()),
            calls: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Prompt {
        self.prompts.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &Prompt, image: Option<&ImageInput>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.is_some() {
            self.images.fetch_add(1, Ordering::SeqCst);
        }
        self.prompts.lock().unwrap().push(prompt.clone());
        self.reply
            .clone()
            .ok_or_else(|| AssistantError::Generation("provider timed out".to_string()))
    }
}

/// Web search double.
pub struct StubWeb {
    results: Option<Vec<WebSnippet>>,
    pub calls: AtomicUsize,
}

impl StubWeb {
    pub fn with(results: Vec<WebSnippet>) -> Arc<Self> {
        Arc::new(Self {
            results: Some(results),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            results: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WebSearch for StubWeb {
    fn name(&self) -> &str {
        "stub"
    }

    async fn search(&self, _query: &str, k: usize) -> Result<Vec<WebSnippet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.results {
            Some(r) => Ok(r.iter().take(k).cloned().collect()),
            None => Err(AssistantError::WebSearch("service unavailable".to_string())),
        }
    }
}

pub fn snippet(title: &str, url: &str, text: &str) -> WebSnippet {
    WebSnippet {
        title: title.to_string(),
        url: url.to_string(),
        snippet: text.to_string(),
        score: 0.7,
        published_at: None,
    }
}

/// An assistant over `dir` with the offline hash embedder and an optional
/// web search double.
pub async fn assistant(
    dir: &std::path::Path,
    generator: Arc<dyn Generator>,
    web: Option<Arc<StubWeb>>,
) -> Assistant {
    let web = web.map(|w| w as Arc<dyn WebSearch>);
    let config = Arc::new(Config::with_data_dir(dir));
    let registry = Arc::new(CourseRegistry::new(
        Arc::clone(&config),
        Arc::new(HashEmbedder::default()),
    ));
    Assistant::from_parts(config, registry, generator, web)
        .await
        .unwrap()
}
