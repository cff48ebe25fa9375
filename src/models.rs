//! Core data models that flow through ingestion, retrieval and answering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AssistantError, Result};
use crate::router::Route;

/// Supported upload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Pptx,
    Txt,
    Csv,
}

impl FileType {
    /// Detect the type from a file name's extension (case-insensitive).
    pub fn from_file_name(name: &str) -> Result<Self> {
        let ext = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(FileType::Pdf),
            "docx" => Ok(FileType::Docx),
            "pptx" => Ok(FileType::Pptx),
            "txt" => Ok(FileType::Txt),
            "csv" => Ok(FileType::Csv),
            "" => Err(AssistantError::UnsupportedFormat(format!(
                "{name} (no extension)"
            ))),
            other => Err(AssistantError::UnsupportedFormat(format!(".{other} ({name})"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Pptx => "pptx",
            FileType::Txt => "txt",
            FileType::Csv => "csv",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileType::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            FileType::Txt => "text/plain",
            FileType::Csv => "text/csv",
        }
    }

    /// True when units carry a page or slide number.
    pub fn is_paged(&self) -> bool {
        matches!(self, FileType::Pdf | FileType::Pptx)
    }
}

impl std::str::FromStr for FileType {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self> {
        FileType::from_file_name(&format!("x.{s}"))
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded file as handed over by the HTTP/CLI layer.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Original file name, used for type detection and replacement matching.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Content hash used as the stable document id.
    pub fn doc_id(&self) -> String {
        doc_id_for(&self.bytes)
    }
}

/// SHA-256 hex digest of a file's bytes.
pub fn doc_id_for(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Chunk ids sort by sequence within a document (zero-padded).
pub fn chunk_id_for(doc_id: &str, seq: usize) -> String {
    format!("{doc_id}-{seq:05}")
}

/// One extracted unit: a PDF page, a slide, a document section or a CSV row group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedUnit {
    pub text: String,
    /// 1-based page or slide number; `None` for unpaged formats.
    pub page_or_slide: Option<u32>,
    pub title: Option<String>,
}

/// Byte range of a chunk inside its unit's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

/// Chunk before it is assigned to a document and embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    /// Index of the source unit within the loader output.
    pub unit_index: usize,
    pub text: String,
    pub page_or_slide: Option<u32>,
    pub title: Option<String>,
    pub char_span: CharSpan,
}

/// An ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub course_id: String,
    pub file_type: FileType,
    pub file_name: String,
    pub storage_path: String,
    pub title: Option<String>,
    /// Number of loader units (pages for PDF, slides for PPTX).
    pub total_units: u32,
    pub ingested_at: i64,
}

/// A stored, immutable chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub seq: usize,
    pub text: String,
    pub page_or_slide: Option<u32>,
    pub title: Option<String>,
    pub char_span: CharSpan,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    pub fn from_draft(doc_id: &str, seq: usize, draft: &ChunkDraft) -> Self {
        Self {
            chunk_id: chunk_id_for(doc_id, seq),
            doc_id: doc_id.to_string(),
            seq,
            text: draft.text.clone(),
            page_or_slide: draft.page_or_slide,
            title: draft.title.clone(),
            char_span: draft.char_span,
            hash: hex::encode(Sha256::digest(draft.text.as_bytes())),
        }
    }
}

/// A stored page (loader unit), kept for the document viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub doc_id: String,
    /// 1-based position of the unit in the document.
    pub number: u32,
    pub page_or_slide: Option<u32>,
    pub title: Option<String>,
    pub text: String,
}

/// What a citation marker points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferenceTarget {
    Chunk {
        doc_id: String,
        chunk_id: String,
        page_or_slide: Option<u32>,
        char_span: CharSpan,
    },
    Web {
        url: String,
    },
}

/// A resolved citation shown next to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// Marker used in the answer text, e.g. `ref2`.
    pub id: String,
    pub target: ReferenceTarget,
    /// File name for course material, domain for web results.
    pub source: String,
    pub title: Option<String>,
    pub score: f32,
}

impl Reference {
    pub fn doc_id(&self) -> Option<&str> {
        match &self.target {
            ReferenceTarget::Chunk { doc_id, .. } => Some(doc_id),
            ReferenceTarget::Web { .. } => None,
        }
    }

    pub fn page_or_slide(&self) -> Option<u32> {
        match &self.target {
            ReferenceTarget::Chunk { page_or_slide, .. } => *page_or_slide,
            ReferenceTarget::Web { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One message in a per-(course, user) history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub references: Vec<Reference>,
    /// Routing decision for assistant turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            references: Vec::new(),
            route: None,
        }
    }

    pub fn assistant(content: impl Into<String>, references: Vec<Reference>, route: Route) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            references,
            route: Some(route),
        }
    }
}

/// An image attached to a question, passed to the generator as a separate input.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    /// e.g. `image/png`.
    pub mime: String,
}

impl ImageInput {
    /// Guess the MIME type from a file name, defaulting to PNG.
    pub fn from_file(name: &str, bytes: Vec<u8>) -> Self {
        let lower = name.to_ascii_lowercase();
        let mime = if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            "image/jpeg"
        } else if lower.ends_with(".gif") {
            "image/gif"
        } else if lower.ends_with(".webp") {
            "image/webp"
        } else {
            "image/png"
        };
        Self {
            bytes,
            mime: mime.to_string(),
        }
    }
}

/// A question as it enters the pipeline. Never persisted itself.
#[derive(Debug, Clone)]
pub struct Query {
    pub course_id: String,
    pub user_id: String,
    pub question: String,
    pub image: Option<ImageInput>,
    /// Explicit discipline hint (`math`, `programming`, ...).
    pub discipline: Option<String>,
}

impl Query {
    pub fn new(
        course_id: impl Into<String>,
        user_id: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            course_id: course_id.into(),
            user_id: user_id.into(),
            question: question.into(),
            image: None,
            discipline: None,
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_discipline(mut self, discipline: impl Into<String>) -> Self {
        self.discipline = Some(discipline.into());
        self
    }
}

/// What `ask` returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub references: Vec<Reference>,
    pub route: Route,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_file_types_case_insensitively() {
        assert_eq!(FileType::from_file_name("a.PDF").unwrap(), FileType::Pdf);
        assert_eq!(FileType::from_file_name("deck.pptx").unwrap(), FileType::Pptx);
        assert_eq!(FileType::from_file_name("x/y/notes.Txt").unwrap(), FileType::Txt);
        assert!(matches!(
            FileType::from_file_name("image.png"),
            Err(AssistantError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FileType::from_file_name("Makefile"),
            Err(AssistantError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn chunk_ids_sort_by_sequence() {
        let a = chunk_id_for("abc", 9);
        let b = chunk_id_for("abc", 10);
        assert!(a < b);
    }

    #[test]
    fn doc_id_is_content_hash() {
        let a = SourceFile::new("a.txt", b"same".to_vec());
        let b = SourceFile::new("b.txt", b"same".to_vec());
        assert_eq!(a.doc_id(), b.doc_id());
        assert_eq!(a.doc_id().len(), 64);
    }
}
