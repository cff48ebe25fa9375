//! Batch ingestion of course materials.
//!
//! Each file is processed on its own: detect type → load → split → store a
//! copy → `add_document`. A failure is recorded in the report and the batch
//! moves on; nothing from the failed file stays in the index or on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunk;
use crate::config::ChunkingConfig;
use crate::error::{AssistantError, Result};
use crate::extract;
use crate::index::CourseIndex;
use crate::models::{Document, FileType, Page, SourceFile};
use crate::registry::CourseRegistry;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestedDocument {
    pub doc_id: String,
    pub file_name: String,
    pub chunks: usize,
    /// Earlier versions of this file that were retired.
    pub replaced: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestFailure {
    pub file: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub added: Vec<IngestedDocument>,
    pub errors: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn added_doc_ids(&self) -> Vec<String> {
        self.added.iter().map(|d| d.doc_id.clone()).collect()
    }

    fn fail(&mut self, course_id: &str, file: &str, err: &AssistantError) {
        warn!(course_id, file, kind = err.kind(), error = %err, "file not ingested");
        self.errors.push(IngestFailure {
            file: file.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }
}

pub struct Ingester {
    registry: Arc<CourseRegistry>,
    chunking: ChunkingConfig,
}

impl Ingester {
    pub fn new(registry: Arc<CourseRegistry>, chunking: ChunkingConfig) -> Self {
        Self { registry, chunking }
    }

    /// Ingest a batch. Only an invalid course id or an index that cannot be
    /// opened fails the whole call.
    pub async fn ingest(&self, course_id: &str, files: Vec<SourceFile>) -> Result<IngestReport> {
        let index = self.registry.get(course_id).await?;
        let mut report = IngestReport::default();
        for file in files {
            let name = file.name.clone();
            match self.ingest_one(&index, file).await {
                Ok(doc) => report.added.push(doc),
                Err(e) => report.fail(course_id, &name, &e),
            }
        }
        info!(
            course_id,
            added = report.added.len(),
            failed = report.errors.len(),
            "ingestion finished"
        );
        Ok(report)
    }

    /// Ingest every regular file under `dir`, named by its path relative to `dir`.
    pub async fn ingest_dir(&self, course_id: &str, dir: &Path) -> Result<IngestReport> {
        let mut files = Vec::new();
        let mut unreadable = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    unreadable.push((path, AssistantError::Io(e.into())));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            match std::fs::read(entry.path()) {
                Ok(bytes) => files.push(SourceFile::new(rel, bytes)),
                Err(e) => unreadable.push((rel, AssistantError::Io(e))),
            }
        }
        let mut report = self.ingest(course_id, files).await?;
        for (file, err) in &unreadable {
            report.fail(course_id, file, err);
        }
        Ok(report)
    }

    async fn ingest_one(&self, index: &CourseIndex, file: SourceFile) -> Result<IngestedDocument> {
        let course_id = index.course_id().to_string();
        let file_type = FileType::from_file_name(&file.name)?;
        let doc_id = file.doc_id();

        let rows = self.chunking.csv_rows_per_unit;
        let name = file.name.clone();
        let bytes = Arc::new(file.bytes);
        let loader_bytes = Arc::clone(&bytes);
        let units = tokio::task::spawn_blocking(move || {
            extract::load_as(file_type, &name, &loader_bytes, rows)
        })
        .await
        .map_err(|e| AssistantError::Extraction {
            file: file.name.clone(),
            message: format!("loader task failed: {e}"),
        })??;

        let drafts = chunk::split(
            &units,
            self.chunking.chunk_chars,
            self.chunking.overlap_chars,
        );
        let pages: Vec<Page> = units
            .iter()
            .enumerate()
            .map(|(i, u)| Page {
                doc_id: doc_id.clone(),
                number: i as u32 + 1,
                page_or_slide: u.page_or_slide,
                title: u.title.clone(),
                text: u.text.clone(),
            })
            .collect();

        let stored = self.store_file(&course_id, &doc_id, file_type, &bytes).await?;
        let document = Document {
            doc_id: doc_id.clone(),
            course_id: course_id.clone(),
            file_type,
            file_name: file.name.clone(),
            storage_path: stored.path.to_string_lossy().into_owned(),
            title: units.iter().find_map(|u| u.title.clone()),
            total_units: units.len() as u32,
            ingested_at: chrono::Utc::now().timestamp(),
        };

        let outcome = match index.add_document(document, pages, &drafts).await {
            Ok(o) => o,
            Err(e) => {
                if stored.created {
                    remove_stored(&course_id, &stored.path).await;
                }
                return Err(e);
            }
        };
        for old in &outcome.retired {
            remove_stored(&course_id, Path::new(&old.storage_path)).await;
        }

        Ok(IngestedDocument {
            doc_id,
            file_name: file.name,
            chunks: outcome.chunks,
            replaced: outcome.retired.into_iter().map(|d| d.doc_id).collect(),
        })
    }

    async fn store_file(
        &self,
        course_id: &str,
        doc_id: &str,
        file_type: FileType,
        bytes: &[u8],
    ) -> Result<StoredFile> {
        let dir = self.registry.files_dir(course_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.{}", doc_id, file_type.as_str()));
        let created = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        if created {
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(StoredFile { path, created })
    }

    /// Remove a document, its chunks and its stored file.
    pub async fn remove_document(&self, course_id: &str, doc_id: &str) -> Result<Document> {
        let index = self.registry.get(course_id).await?;
        let doc = index
            .remove_document(doc_id)
            .await?
            .ok_or_else(|| AssistantError::NotFound {
                what: "document",
                id: doc_id.to_string(),
            })?;
        remove_stored(course_id, Path::new(&doc.storage_path)).await;
        Ok(doc)
    }

    /// Re-embed a whole course with the configured embedder.
    pub async fn rebuild(&self, course_id: &str) -> Result<usize> {
        let index = self.registry.get(course_id).await?;
        let n = index.rebuild().await?;
        info!(course_id, chunks = n, "course index rebuilt");
        Ok(n)
    }
}

struct StoredFile {
    path: PathBuf,
    /// False when an identical upload was already stored.
    created: bool,
}

async fn remove_stored(course_id: &str, path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(course_id, path = %path.display(), error = %e, "failed to delete stored file"),
    }
}
