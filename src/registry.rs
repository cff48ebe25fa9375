//! Per-course index registry.
//!
//! Owns `course_id → Arc<CourseIndex>`. An index is opened on first use
//! (created if absent, loaded from disk otherwise) and stays resident until
//! more than `max_resident_courses` are open, at which point the least
//! recently used *idle* index is dropped. An index still held by an
//! in-flight request is never evicted.
//!
//! ```text
//! <data_dir>/courses/<course_id>/index.sqlite
//! <data_dir>/courses/<course_id>/files/<doc_id>.<ext>
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{validate_course_id, Result};
use crate::index::CourseIndex;
use crate::store::{ChunkStore, MemoryChunkStore, SqliteChunkStore};

/// Where course stores live.
enum Backend {
    Sqlite,
    /// Stores kept for the life of the registry; used by tests.
    Memory(std::sync::Mutex<HashMap<String, Arc<MemoryChunkStore>>>),
}

struct Resident {
    index: Arc<CourseIndex>,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    resident: HashMap<String, Resident>,
    clock: u64,
}

pub struct CourseRegistry {
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    backend: Backend,
    inner: Mutex<Inner>,
}

impl CourseRegistry {
    /// Registry persisting each course under `config.storage.data_dir`.
    pub fn new(config: Arc<Config>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            backend: Backend::Sqlite,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registry whose indexes live in memory only. Uploaded files still go
    /// under `config.storage.data_dir`.
    pub fn in_memory(config: Arc<Config>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            backend: Backend::Memory(std::sync::Mutex::new(HashMap::new())),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn course_dir(&self, course_id: &str) -> PathBuf {
        self.config.storage.course_dir(course_id)
    }

    pub fn files_dir(&self, course_id: &str) -> PathBuf {
        self.course_dir(course_id).join("files")
    }

    /// The index for `course_id`, opening it if it is not resident.
    pub async fn get(&self, course_id: &str) -> Result<Arc<CourseIndex>> {
        validate_course_id(course_id)?;
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let now = inner.clock;

        if let Some(resident) = inner.resident.get_mut(course_id) {
            resident.last_used = now;
            return Ok(Arc::clone(&resident.index));
        }

        let index = Arc::new(self.open(course_id).await?);
        inner.resident.insert(
            course_id.to_string(),
            Resident {
                index: Arc::clone(&index),
                last_used: now,
            },
        );
        self.evict_idle(&mut inner, course_id);
        Ok(index)
    }

    async fn open(&self, course_id: &str) -> Result<CourseIndex> {
        let store: Arc<dyn ChunkStore> = match &self.backend {
            Backend::Sqlite => {
                let path = self.course_dir(course_id).join("index.sqlite");
                Arc::new(SqliteChunkStore::open(course_id, &path).await?)
            }
            Backend::Memory(stores) => {
                let mut stores = stores.lock().map_err(|_| {
                    crate::error::AssistantError::IndexConsistency {
                        course_id: course_id.to_string(),
                        message: "registry lock poisoned".to_string(),
                    }
                })?;
                let store = stores
                    .entry(course_id.to_string())
                    .or_insert_with(|| Arc::new(MemoryChunkStore::new()));
                Arc::clone(store) as Arc<dyn ChunkStore>
            }
        };
        debug!(course_id, "opening course index");
        CourseIndex::open(
            course_id,
            store,
            Arc::clone(&self.embedder),
            self.config.retrieval.metric,
            self.config.embedding.batch_size,
        )
        .await
    }

    fn evict_idle(&self, inner: &mut Inner, keep: &str) {
        let max = self.config.registry.max_resident_courses.max(1);
        while inner.resident.len() > max {
            let victim = inner
                .resident
                .iter()
                .filter(|(id, r)| id.as_str() != keep && Arc::strong_count(&r.index) == 1)
                .min_by_key(|(_, r)| r.last_used)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    inner.resident.remove(&id);
                    info!(course_id = %id, "evicted idle course index");
                }
                None => break,
            }
        }
    }

    /// Drop a resident index unless a request still holds it. Returns
    /// whether it was dropped.
    pub async fn evict(&self, course_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.resident.get(course_id) {
            Some(r) if Arc::strong_count(&r.index) == 1 => {
                inner.resident.remove(course_id);
                info!(course_id, "evicted course index");
                true
            }
            Some(_) => {
                debug!(course_id, "course index in use; not evicted");
                false
            }
            None => false,
        }
    }

    pub async fn resident_courses(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.resident.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Courses with persisted state, sorted.
    pub fn list_courses(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = match &self.backend {
            Backend::Memory(stores) => stores
                .lock()
                .map(|s| s.keys().cloned().collect())
                .unwrap_or_default(),
            Backend::Sqlite => {
                let dir = self.config.storage.courses_dir();
                if !dir.exists() {
                    return Ok(Vec::new());
                }
                let mut ids = Vec::new();
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str() {
                        if validate_course_id(name).is_ok() && entry.path().join("index.sqlite").exists() {
                            ids.push(name.to_string());
                        }
                    }
                }
                ids
            }
        };
        ids.sort();
        Ok(ids)
    }
}
