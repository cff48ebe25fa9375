//! Durable storage behind a course index.
//!
//! The [`ChunkStore`] trait is what [`CourseIndex`](crate::index::CourseIndex)
//! persists through. One store holds exactly one course.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`index_meta`](ChunkStore::index_meta) | Embedding model, dims and metric the index was built with |
//! | [`replace_document`](ChunkStore::replace_document) | Commit a document with its pages, chunks and vectors; retire superseded documents |
//! | [`remove_document`](ChunkStore::remove_document) | Purge a document and everything derived from it |
//! | [`load_all`](ChunkStore::load_all) | Documents plus chunks with vectors, for building the search snapshot |
//! | [`get_page`](ChunkStore::get_page) | One stored loader unit, for the viewer |
//! | [`replace_vectors`](ChunkStore::replace_vectors) | Rewrite every vector after a rebuild |
//!
//! Multi-statement writes are transactional: a crash mid-write leaves the
//! previously committed state intact.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::config::Metric;
use crate::error::Result;
use crate::models::{Chunk, Document, Page};

pub use memory::MemoryChunkStore;
pub use sqlite::SqliteChunkStore;

/// What an index was built with. Recorded on first write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub embedding_model: String,
    pub dims: usize,
    pub metric: Metric,
}

/// A chunk and its embedding.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// One document's complete replacement set.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    pub document: Document,
    pub pages: Vec<Page>,
    pub chunks: Vec<StoredChunk>,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn index_meta(&self) -> Result<Option<IndexMeta>>;

    /// Atomically: drop any previous rows for `write.document.doc_id` and for
    /// every id in `retire`, insert the new rows, and record `meta`.
    async fn replace_document(
        &self,
        write: &DocumentWrite,
        retire: &[String],
        meta: &IndexMeta,
    ) -> Result<()>;

    /// Returns whether the document existed.
    async fn remove_document(&self, doc_id: &str) -> Result<bool>;

    async fn load_all(&self) -> Result<(Vec<Document>, Vec<StoredChunk>)>;

    async fn get_page(&self, doc_id: &str, number: u32) -> Result<Option<Page>>;

    /// Atomically overwrite vectors by chunk id and record `meta`.
    async fn replace_vectors(&self, vectors: &[(String, Vec<f32>)], meta: &IndexMeta)
        -> Result<()>;
}
