//! Course index: the chunks, vectors and documents of one course, with
//! brute-force nearest-neighbour search.
//!
//! Writes (`add_document`, `remove_document`, `rebuild`) are serialized by an
//! async mutex and committed to the [`ChunkStore`] in a single transaction
//! before the in-memory snapshot is swapped. Searches clone the current
//! snapshot `Arc` and never block on a writer, so they observe either the
//! state before a write or the state after it.
//!
//! Embedding happens before anything is written: if any batch fails, the
//! store and snapshot are left untouched.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use crate::config::Metric;
use crate::embedding::{cosine_similarity, l2_distance, Embedder};
use crate::error::{AssistantError, Result};
use crate::models::{Chunk, ChunkDraft, Document, Page};
use crate::store::{ChunkStore, DocumentWrite, IndexMeta, StoredChunk};

impl Metric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::L2 => l2_distance(a, b),
        }
    }

    /// Similarity in `[0, 1]` (cosine can go below 0 for opposed vectors).
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::L2 => 1.0 / (1.0 + distance),
        }
    }
}

/// A search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub distance: f32,
    pub score: f32,
}

/// Result of a committed `add_document`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub chunks: usize,
    /// Documents with the same file name that this one superseded.
    pub retired: Vec<Document>,
    /// True when the same `doc_id` was already indexed.
    pub replaced_same: bool,
}

#[derive(Default)]
struct Snapshot {
    documents: HashMap<String, Document>,
    /// Sorted by `chunk_id`.
    entries: Vec<StoredChunk>,
}

impl Snapshot {
    fn build(documents: Vec<Document>, mut entries: Vec<StoredChunk>) -> Self {
        entries.sort_by(|a, b| a.chunk.chunk_id.cmp(&b.chunk.chunk_id));
        Self {
            documents: documents
                .into_iter()
                .map(|d| (d.doc_id.clone(), d))
                .collect(),
            entries,
        }
    }

    fn without(&self, doc_ids: &[&str]) -> (Vec<Document>, Vec<StoredChunk>) {
        let docs = self
            .documents
            .values()
            .filter(|d| !doc_ids.contains(&d.doc_id.as_str()))
            .cloned()
            .collect();
        let entries = self
            .entries
            .iter()
            .filter(|e| !doc_ids.contains(&e.chunk.doc_id.as_str()))
            .cloned()
            .collect();
        (docs, entries)
    }
}

pub struct CourseIndex {
    course_id: String,
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    metric: Metric,
    batch_size: usize,
    write_lock: tokio::sync::Mutex<()>,
    snapshot: RwLock<Arc<Snapshot>>,
    meta: RwLock<Option<IndexMeta>>,
}

impl CourseIndex {
    /// Load the committed state from `store`.
    ///
    /// Fails with [`AssistantError::Configuration`] when the index was built
    /// with a different metric. An embedder mismatch does not fail here so the
    /// index can still be rebuilt; searches and writes report
    /// [`AssistantError::EmbeddingModelMismatch`] until it is.
    pub async fn open(
        course_id: &str,
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        metric: Metric,
        batch_size: usize,
    ) -> Result<Self> {
        let meta = store.index_meta().await?;
        if let Some(m) = &meta {
            if m.metric != metric {
                return Err(AssistantError::Configuration(format!(
                    "course {course_id} was indexed with the {} metric but retrieval.metric is {}; \
                     mixing metrics requires a fresh index",
                    m.metric.as_str(),
                    metric.as_str()
                )));
            }
        }
        let (documents, entries) = store.load_all().await?;
        debug!(
            course_id,
            documents = documents.len(),
            chunks = entries.len(),
            "loaded course index"
        );

        let index = Self {
            course_id: course_id.to_string(),
            store,
            embedder,
            metric,
            batch_size: batch_size.max(1),
            write_lock: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Snapshot::build(documents, entries))),
            meta: RwLock::new(meta),
        };
        if let Err(e) = index.check_embedder() {
            warn!(course_id, error = %e, "course index needs a rebuild");
        }
        Ok(index)
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn current(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| self.consistency("snapshot lock poisoned"))
    }

    fn swap(&self, next: Snapshot) -> Result<()> {
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| self.consistency("snapshot lock poisoned"))?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn set_meta(&self, meta: IndexMeta) -> Result<()> {
        let mut guard = self
            .meta
            .write()
            .map_err(|_| self.consistency("meta lock poisoned"))?;
        *guard = Some(meta);
        Ok(())
    }

    fn consistency(&self, message: &str) -> AssistantError {
        error!(course_id = %self.course_id, message, "index consistency violation");
        AssistantError::IndexConsistency {
            course_id: self.course_id.clone(),
            message: message.to_string(),
        }
    }

    fn configured_meta(&self) -> IndexMeta {
        IndexMeta {
            embedding_model: self.embedder.model_name().to_string(),
            dims: self.embedder.dims(),
            metric: self.metric,
        }
    }

    /// Fails when the stored vectors came from a different embedder.
    pub fn check_embedder(&self) -> Result<()> {
        let guard = self
            .meta
            .read()
            .map_err(|_| self.consistency("meta lock poisoned"))?;
        match guard.as_ref() {
            Some(m) if m.embedding_model != self.embedder.model_name()
                || m.dims != self.embedder.dims() =>
            {
                Err(AssistantError::EmbeddingModelMismatch {
                    course_id: self.course_id.clone(),
                    stored: format!("{}/{}", m.embedding_model, m.dims),
                    configured: crate::embedding::identity(self.embedder.as_ref()),
                })
            }
            _ => Ok(()),
        }
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embedder.embed(batch).await?);
        }
        crate::embedding::check_vectors(vectors, texts.len(), self.embedder.dims())
    }

    pub fn documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.current()?.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.file_name.cmp(&b.file_name).then(a.doc_id.cmp(&b.doc_id)));
        Ok(docs)
    }

    pub fn document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self.current()?.documents.get(doc_id).cloned())
    }

    pub fn chunk_count(&self) -> Result<usize> {
        Ok(self.current()?.entries.len())
    }

    /// Chunks of one document in sequence order.
    pub fn chunks_of(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let snap = self.current()?;
        let mut chunks: Vec<Chunk> = snap
            .entries
            .iter()
            .filter(|e| e.chunk.doc_id == doc_id)
            .map(|e| e.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.seq);
        Ok(chunks)
    }

    pub async fn get_page(&self, doc_id: &str, number: u32) -> Result<Option<Page>> {
        self.store.get_page(doc_id, number).await
    }

    /// Embed and commit one document, replacing any earlier version with the
    /// same `doc_id` and retiring other documents with the same file name.
    pub async fn add_document(
        &self,
        document: Document,
        pages: Vec<Page>,
        drafts: &[ChunkDraft],
    ) -> Result<AddOutcome> {
        self.check_embedder()?;
        let _guard = self.write_lock.lock().await;
        let doc_id = document.doc_id.clone();

        let chunks: Vec<Chunk> = drafts
            .iter()
            .enumerate()
            .map(|(seq, d)| Chunk::from_draft(&doc_id, seq, d))
            .collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_all(&texts).await.inspect_err(|e| {
            warn!(course_id = %self.course_id, doc_id = %doc_id, error = %e, "embedding failed; nothing indexed");
        })?;

        let snap = self.current()?;
        let replaced_same = snap.documents.contains_key(&doc_id);
        let retired: Vec<Document> = snap
            .documents
            .values()
            .filter(|d| d.file_name == document.file_name && d.doc_id != doc_id)
            .cloned()
            .collect();
        let retire_ids: Vec<String> = retired.iter().map(|d| d.doc_id.clone()).collect();

        let stored: Vec<StoredChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| StoredChunk { chunk, vector })
            .collect();
        let write = DocumentWrite {
            document,
            pages,
            chunks: stored,
        };
        let meta = self.configured_meta();
        self.store
            .replace_document(&write, &retire_ids, &meta)
            .await?;

        let mut drop_ids: Vec<&str> = retire_ids.iter().map(String::as_str).collect();
        drop_ids.push(&doc_id);
        let (mut docs, mut entries) = snap.without(&drop_ids);
        let n = write.chunks.len();
        docs.push(write.document);
        entries.extend(write.chunks);
        self.swap(Snapshot::build(docs, entries))?;
        self.set_meta(meta)?;

        info!(
            course_id = %self.course_id,
            doc_id = %doc_id,
            chunks = n,
            retired = retire_ids.len(),
            "document indexed"
        );
        Ok(AddOutcome {
            chunks: n,
            retired,
            replaced_same,
        })
    }

    /// Purge a document. Returns it if it was indexed.
    pub async fn remove_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let _guard = self.write_lock.lock().await;
        let snap = self.current()?;
        let existing = snap.documents.get(doc_id).cloned();
        self.store.remove_document(doc_id).await?;
        let (docs, entries) = snap.without(&[doc_id]);
        self.swap(Snapshot::build(docs, entries))?;
        if existing.is_some() {
            info!(course_id = %self.course_id, doc_id, "document removed");
        }
        Ok(existing)
    }

    /// Nearest neighbours of `query`, closest first; equal distances are
    /// ordered by ascending `chunk_id`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.check_embedder()?;
        let snap = self.current()?;
        if snap.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.embedder.dims() {
            return Err(self.consistency(&format!(
                "query vector has {} dims, index expects {}",
                query.len(),
                self.embedder.dims()
            )));
        }

        let mut scored = Vec::with_capacity(snap.entries.len());
        for entry in &snap.entries {
            if entry.vector.len() != query.len() {
                return Err(self.consistency(&format!(
                    "chunk {} has {} dims, expected {}",
                    entry.chunk.chunk_id,
                    entry.vector.len(),
                    query.len()
                )));
            }
            scored.push((self.metric.distance(query, &entry.vector), entry));
        }
        // entries are already in chunk_id order, so a stable sort on distance
        // keeps the tie-break.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, entry)| SearchHit {
                chunk: entry.chunk.clone(),
                distance,
                score: self.metric.score(distance),
            })
            .collect())
    }

    /// Re-embed every stored chunk with the current embedder and rewrite the
    /// vectors and index metadata in one transaction.
    pub async fn rebuild(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let snap = self.current()?;
        let texts: Vec<String> = snap.entries.iter().map(|e| e.chunk.text.clone()).collect();
        let vectors = self.embed_all(&texts).await?;

        let pairs: Vec<(String, Vec<f32>)> = snap
            .entries
            .iter()
            .map(|e| e.chunk.chunk_id.clone())
            .zip(vectors.iter().cloned())
            .collect();
        let meta = self.configured_meta();
        self.store.replace_vectors(&pairs, &meta).await?;

        let entries = snap
            .entries
            .iter()
            .zip(vectors)
            .map(|(e, vector)| StoredChunk {
                chunk: e.chunk.clone(),
                vector,
            })
            .collect();
        let docs = snap.documents.values().cloned().collect();
        self.swap(Snapshot::build(docs, entries))?;
        self.set_meta(meta)?;
        info!(course_id = %self.course_id, chunks = texts.len(), "index rebuilt");
        Ok(texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{CharSpan, FileType};
    use crate::store::MemoryChunkStore;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc(doc_id: &str, file_name: &str) -> Document {
        Document {
            doc_id: doc_id.to_string(),
            course_id: "CS101".to_string(),
            file_type: FileType::Txt,
            file_name: file_name.to_string(),
            storage_path: format!("files/{doc_id}.txt"),
            title: None,
            total_units: 1,
            ingested_at: 0,
        }
    }

    fn drafts(texts: &[&str]) -> Vec<ChunkDraft> {
        texts
            .iter()
            .map(|t| ChunkDraft {
                unit_index: 0,
                text: t.to_string(),
                page_or_slide: None,
                title: None,
                char_span: CharSpan {
                    start: 0,
                    end: t.len(),
                },
            })
            .collect()
    }

    async fn index_with(embedder: Arc<dyn Embedder>) -> (CourseIndex, Arc<MemoryChunkStore>) {
        let store = Arc::new(MemoryChunkStore::new());
        let index = CourseIndex::open("CS101", store.clone(), embedder, Metric::Cosine, 2)
            .await
            .unwrap();
        (index, store)
    }

    /// Fails every call after the first `ok_calls`.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        ok_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_calls {
                return Err(AssistantError::Embedding("provider down".to_string()));
            }
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn self_retrieval_ranks_first() {
        let (index, _) = index_with(Arc::new(HashEmbedder::new(256))).await;
        let texts = [
            "Stacks are last in first out",
            "Queues are first in first out",
            "Heaps keep the minimum at the root",
        ];
        index
            .add_document(doc("d1", "ds.txt"), vec![], &drafts(&texts))
            .await
            .unwrap();

        for (seq, text) in texts.iter().enumerate() {
            let q = index.embedder().embed_query(text).await.unwrap();
            let hits = index.search(&q, 3).unwrap();
            assert_eq!(hits[0].chunk.seq, seq);
            assert!(hits[0].distance.abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn remove_document_hides_its_chunks() {
        let (index, store) = index_with(Arc::new(HashEmbedder::new(64))).await;
        index
            .add_document(doc("d1", "a.txt"), vec![], &drafts(&["alpha beta"]))
            .await
            .unwrap();
        index
            .add_document(doc("d2", "b.txt"), vec![], &drafts(&["alpha gamma"]))
            .await
            .unwrap();

        let removed = index.remove_document("d1").await.unwrap();
        assert_eq!(removed.unwrap().doc_id, "d1");
        let q = index.embedder().embed_query("alpha beta").await.unwrap();
        let hits = index.search(&q, 10).unwrap();
        assert!(hits.iter().all(|h| h.chunk.doc_id != "d1"));
        assert_eq!(store.load_all().await.unwrap().1.len(), 1);
        assert!(index.remove_document("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn adding_twice_is_idempotent() {
        let (index, _) = index_with(Arc::new(HashEmbedder::new(64))).await;
        let d = drafts(&["one", "two", "three"]);
        let first = index.add_document(doc("d1", "a.txt"), vec![], &d).await.unwrap();
        let ids_once: Vec<String> = index
            .chunks_of("d1")
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();
        let second = index.add_document(doc("d1", "a.txt"), vec![], &d).await.unwrap();
        let ids_twice: Vec<String> = index
            .chunks_of("d1")
            .unwrap()
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();

        assert!(!first.replaced_same);
        assert!(second.replaced_same);
        assert_eq!(ids_once, ids_twice);
        assert_eq!(index.chunk_count().unwrap(), 3);
        assert_eq!(index.documents().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_file_name_retires_previous_version() {
        let (index, _) = index_with(Arc::new(HashEmbedder::new(64))).await;
        index
            .add_document(doc("v1", "syllabus.txt"), vec![], &drafts(&["old policy"]))
            .await
            .unwrap();
        let outcome = index
            .add_document(doc("v2", "syllabus.txt"), vec![], &drafts(&["new policy"]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AddOutcome {
                chunks: 1,
                retired: vec![doc("v1", "syllabus.txt")],
                replaced_same: false,
            }
        );
        let ids: Vec<String> = index.documents().unwrap().into_iter().map(|d| d.doc_id).collect();
        assert_eq!(ids, vec!["v2"]);
    }

    #[tokio::test]
    async fn embedding_failure_leaves_index_untouched() {
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashEmbedder::new(32),
            ok_calls: 1,
            calls: AtomicUsize::new(0),
        });
        let (index, store) = index_with(embedder).await;
        // batch_size 2: second batch fails
        let err = index
            .add_document(doc("d1", "a.txt"), vec![], &drafts(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::Embedding(_)));
        assert_eq!(index.chunk_count().unwrap(), 0);
        assert!(store.load_all().await.unwrap().0.is_empty());
        assert!(store.index_meta().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_distances_break_ties_by_chunk_id() {
        let (index, _) = index_with(Arc::new(HashEmbedder::new(64))).await;
        index
            .add_document(doc("bbb", "b.txt"), vec![], &drafts(&["same text"]))
            .await
            .unwrap();
        index
            .add_document(doc("aaa", "a.txt"), vec![], &drafts(&["same text"]))
            .await
            .unwrap();
        let q = index.embedder().embed_query("same text").await.unwrap();
        for _ in 0..3 {
            let hits = index.search(&q, 2).unwrap();
            assert_eq!(hits[0].chunk.doc_id, "aaa");
            assert_eq!(hits[1].chunk.doc_id, "bbb");
        }
    }

    #[tokio::test]
    async fn embedder_change_requires_rebuild() {
        let store = Arc::new(MemoryChunkStore::new());
        let index = CourseIndex::open(
            "CS101",
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
            Metric::Cosine,
            8,
        )
        .await
        .unwrap();
        index
            .add_document(doc("d1", "a.txt"), vec![], &drafts(&["graphs and trees"]))
            .await
            .unwrap();

        let reopened = CourseIndex::open(
            "CS101",
            store.clone(),
            Arc::new(HashEmbedder::new(128)),
            Metric::Cosine,
            8,
        )
        .await
        .unwrap();
        let q = reopened.embedder().embed_query("graphs").await.unwrap();
        assert!(matches!(
            reopened.search(&q, 1),
            Err(AssistantError::EmbeddingModelMismatch { .. })
        ));

        assert_eq!(reopened.rebuild().await.unwrap(), 1);
        let hits = reopened.search(&q, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.index_meta().await.unwrap().unwrap().dims, 128);
    }

    #[tokio::test]
    async fn metric_change_is_a_configuration_error() {
        let store = Arc::new(MemoryChunkStore::new());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
        let index = CourseIndex::open("CS101", store.clone(), embedder.clone(), Metric::Cosine, 8)
            .await
            .unwrap();
        index
            .add_document(doc("d1", "a.txt"), vec![], &drafts(&["x"]))
            .await
            .unwrap();
        let err = CourseIndex::open("CS101", store, embedder, Metric::L2, 8)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AssistantError::Configuration(_)));
    }

    #[tokio::test]
    async fn wrong_query_dims_is_a_consistency_error() {
        let (index, _) = index_with(Arc::new(HashEmbedder::new(16))).await;
        index
            .add_document(doc("d1", "a.txt"), vec![], &drafts(&["x"]))
            .await
            .unwrap();
        assert!(matches!(
            index.search(&[1.0, 0.0], 1),
            Err(AssistantError::IndexConsistency { .. })
        ));
    }

    #[test]
    fn l2_scores_fall_with_distance() {
        assert_eq!(Metric::L2.score(0.0), 1.0);
        assert!(Metric::L2.score(1.0) < Metric::L2.score(0.5));
        assert!((Metric::Cosine.score(0.25) - 0.75).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn prop_search_is_sorted_and_deterministic(
            texts in proptest::collection::vec("[a-d]{1,3}( [a-d]{1,3}){0,3}", 1..12),
            query in "[a-d]{1,3}( [a-d]{1,3}){0,2}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (index, _) = index_with(Arc::new(HashEmbedder::new(16))).await;
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                index.add_document(doc("d1", "a.txt"), vec![], &drafts(&refs)).await.unwrap();
                let q = index.embedder().embed_query(&query).await.unwrap();
                let first = index.search(&q, texts.len()).unwrap();
                let second = index.search(&q, texts.len()).unwrap();
                assert_eq!(first.len(), texts.len());
                for pair in first.windows(2) {
                    assert!(pair[0].distance < pair[1].distance
                        || (pair[0].distance == pair[1].distance
                            && pair[0].chunk.chunk_id < pair[1].chunk.chunk_id));
                }
                let a: Vec<_> = first.iter().map(|h| &h.chunk.chunk_id).collect();
                let b: Vec<_> = second.iter().map(|h| &h.chunk.chunk_id).collect();
                assert_eq!(a, b);
            });
        }
    }
}
