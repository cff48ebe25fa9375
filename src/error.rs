//! Error taxonomy for the answer pipeline.
//!
//! Library APIs return [`Result`]; the CLI and configuration loader use
//! `anyhow` on top of it. Variants map one-to-one onto how the caller must
//! react:
//!
//! | Variant | Reaction |
//! |---------|----------|
//! | [`UnsupportedFormat`](AssistantError::UnsupportedFormat) | reported per file, batch continues |
//! | [`Extraction`](AssistantError::Extraction) | reported per file, batch continues |
//! | [`Embedding`](AssistantError::Embedding) | retried by the provider, then surfaced; no partial index writes |
//! | [`Generation`](AssistantError::Generation) | turned into an apology answer, turn still recorded |
//! | [`IndexConsistency`](AssistantError::IndexConsistency) | internal invariant violation, logged at error level |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    /// File type is not one of pdf, docx, pptx, txt, csv.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The file has a supported type but could not be parsed.
    #[error("extraction failed for {file}: {message}")]
    Extraction { file: String, message: String },

    /// Embedding provider failure after retries.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Answer generator failure after retries (timeout, rate limit, provider error).
    #[error("generation failed: {0}")]
    Generation(String),

    /// Web search provider failure.
    #[error("web search failed: {0}")]
    WebSearch(String),

    /// A read observed state that the locking discipline should make impossible.
    #[error("index consistency violation in course {course_id}: {message}")]
    IndexConsistency { course_id: String, message: String },

    /// The stored index was built with a different embedding model or dimensionality.
    #[error(
        "course {course_id} was indexed with {stored} but the configured embedder is {configured}; run `ellie rebuild {course_id}`"
    )]
    EmbeddingModelMismatch {
        course_id: String,
        stored: String,
        configured: String,
    },

    /// Settings conflict with persisted state (e.g. a different distance metric).
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid course id: {0:?}")]
    InvalidCourseId(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("page {page} out of range (document has {total})")]
    PageOutOfRange { page: u32, total: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AssistantError {
    /// Short machine-readable kind, used in ingestion reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AssistantError::UnsupportedFormat(_) => "unsupported_format",
            AssistantError::Extraction { .. } => "extraction_error",
            AssistantError::Embedding(_) => "embedding_error",
            AssistantError::Generation(_) => "generation_error",
            AssistantError::WebSearch(_) => "web_search_error",
            AssistantError::IndexConsistency { .. } => "index_consistency_error",
            AssistantError::EmbeddingModelMismatch { .. } => "embedding_model_mismatch",
            AssistantError::Configuration(_) => "configuration_error",
            AssistantError::InvalidCourseId(_) => "invalid_course_id",
            AssistantError::NotFound { .. } => "not_found",
            AssistantError::PageOutOfRange { .. } => "page_out_of_range",
            AssistantError::InvalidInput(_) => "invalid_input",
            AssistantError::Storage(_) => "storage_error",
            AssistantError::Io(_) => "io_error",
            AssistantError::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;

/// Validate a course id before it is used as a directory name.
///
/// Accepts 1–64 characters from `[A-Za-z0-9._-]`, excluding `.` and `..`.
pub fn validate_course_id(course_id: &str) -> Result<()> {
    let ok = !course_id.is_empty()
        && course_id.len() <= 64
        && course_id != "."
        && course_id != ".."
        && course_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(AssistantError::InvalidCourseId(course_id.to_string()))
    }
}
