//! Query-time retrieval: embed the question with the course's embedder,
//! search the course index and drop candidates below `min_score`.
//!
//! Fewer than `k` results, or none, is a normal outcome and means "no
//! course-relevant material"; the router decides what to do with that.

use std::sync::Arc;

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::models::Chunk;
use crate::registry::CourseRegistry;

/// A retrieved chunk with the display data a reference needs.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub score: f32,
    pub distance: f32,
    /// File name of the owning document.
    pub source: String,
}

pub struct Retriever {
    registry: Arc<CourseRegistry>,
    top_k: usize,
    min_score: f32,
}

impl Retriever {
    pub fn new(registry: Arc<CourseRegistry>, config: &RetrievalConfig) -> Self {
        Self {
            registry,
            top_k: config.top_k,
            min_score: config.min_score,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Up to `k` (default `top_k`) candidates scoring at least `min_score`,
    /// best first.
    pub async fn retrieve(
        &self,
        course_id: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<Vec<Candidate>> {
        let index = self.registry.get(course_id).await?;
        if index.chunk_count()? == 0 {
            return Ok(Vec::new());
        }
        index.check_embedder()?;
        let query = index.embedder().embed_query(question).await?;
        let hits = index.search(&query, k.unwrap_or(self.top_k))?;
        let total = hits.len();

        let mut candidates = Vec::with_capacity(total);
        for hit in hits.into_iter().filter(|h| h.score >= self.min_score) {
            let source = index
                .document(&hit.chunk.doc_id)?
                .map(|d| d.file_name)
                .unwrap_or_else(|| hit.chunk.doc_id.clone());
            candidates.push(Candidate {
                chunk: hit.chunk,
                score: hit.score,
                distance: hit.distance,
                source,
            });
        }
        debug!(
            course_id,
            hits = total,
            kept = candidates.len(),
            min_score = self.min_score,
            "retrieved"
        );
        Ok(candidates)
    }
}
