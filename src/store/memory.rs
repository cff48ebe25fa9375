//! In-memory [`ChunkStore`] for tests.
//!
//! All state sits behind one `std::sync::RwLock`, so each write is atomic
//! with respect to readers.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ChunkStore, DocumentWrite, IndexMeta, StoredChunk};
use crate::error::{AssistantError, Result};
use crate::models::{Document, Page};

#[derive(Default)]
struct Inner {
    meta: Option<IndexMeta>,
    documents: BTreeMap<String, DocumentWrite>,
}

#[derive(Default)]
pub struct MemoryChunkStore {
    inner: RwLock<Inner>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> AssistantError {
    AssistantError::IndexConsistency {
        course_id: String::new(),
        message: "memory store lock poisoned".to_string(),
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn index_meta(&self) -> Result<Option<IndexMeta>> {
        Ok(self.read()?.meta.clone())
    }

    async fn replace_document(
        &self,
        write: &DocumentWrite,
        retire: &[String],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut inner = self.write()?;
        for old in retire {
            inner.documents.remove(old);
        }
        inner
            .documents
            .insert(write.document.doc_id.clone(), write.clone());
        inner.meta = Some(meta.clone());
        Ok(())
    }

    async fn remove_document(&self, doc_id: &str) -> Result<bool> {
        Ok(self.write()?.documents.remove(doc_id).is_some())
    }

    async fn load_all(&self) -> Result<(Vec<Document>, Vec<StoredChunk>)> {
        let inner = self.read()?;
        let documents = inner
            .documents
            .values()
            .map(|w| w.document.clone())
            .collect();
        let chunks = inner
            .documents
            .values()
            .flat_map(|w| w.chunks.iter().cloned())
            .collect();
        Ok((documents, chunks))
    }

    async fn get_page(&self, doc_id: &str, number: u32) -> Result<Option<Page>> {
        Ok(self
            .read()?
            .documents
            .get(doc_id)
            .and_then(|w| w.pages.iter().find(|p| p.number == number).cloned()))
    }

    async fn replace_vectors(
        &self,
        vectors: &[(String, Vec<f32>)],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut inner = self.write()?;
        let by_id: std::collections::HashMap<&str, &Vec<f32>> =
            vectors.iter().map(|(id, v)| (id.as_str(), v)).collect();
        for write in inner.documents.values_mut() {
            for stored in &mut write.chunks {
                if let Some(v) = by_id.get(stored.chunk.chunk_id.as_str()) {
                    stored.vector = (*v).clone();
                }
            }
        }
        inner.meta = Some(meta.clone());
        Ok(())
    }
}
