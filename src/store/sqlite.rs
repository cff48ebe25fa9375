//! SQLite-backed [`ChunkStore`]: one `index.sqlite` per course.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{ChunkStore, DocumentWrite, IndexMeta, StoredChunk};
use crate::config::Metric;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{AssistantError, Result};
use crate::models::{CharSpan, Chunk, Document, FileType, Page};

pub struct SqliteChunkStore {
    course_id: String,
    pool: SqlitePool,
}

impl SqliteChunkStore {
    /// Open the store at `path`, creating the file and schema if absent.
    pub async fn open(course_id: &str, path: &Path) -> Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::migrate_course_index(&pool).await?;
        Ok(Self {
            course_id: course_id.to_string(),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn document_from_row(&self, row: &SqliteRow) -> Result<Document> {
        let file_type: String = row.get("file_type");
        Ok(Document {
            doc_id: row.get("doc_id"),
            course_id: self.course_id.clone(),
            file_type: file_type.parse::<FileType>()?,
            file_name: row.get("file_name"),
            storage_path: row.get("storage_path"),
            title: row.get("title"),
            total_units: row.get::<i64, _>("total_units") as u32,
            ingested_at: row.get("ingested_at"),
        })
    }
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        chunk_id: row.get("chunk_id"),
        doc_id: row.get("doc_id"),
        seq: row.get::<i64, _>("seq") as usize,
        text: row.get("text"),
        page_or_slide: row.get::<Option<i64>, _>("page_or_slide").map(|p| p as u32),
        title: row.get("title"),
        char_span: CharSpan {
            start: row.get::<i64, _>("span_start") as usize,
            end: row.get::<i64, _>("span_end") as usize,
        },
        hash: row.get("hash"),
    }
}

async fn delete_document_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc_id: &str,
) -> Result<u64> {
    for table in ["chunk_vectors", "chunks", "pages"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE doc_id = ?"))
            .bind(doc_id)
            .execute(&mut **tx)
            .await?;
    }
    let res = sqlx::query("DELETE FROM documents WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected())
}

async fn write_meta(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    meta: &IndexMeta,
) -> Result<()> {
    let entries = [
        ("embedding_model", meta.embedding_model.clone()),
        ("dims", meta.dims.to_string()),
        ("metric", meta.metric.as_str().to_string()),
    ];
    for (key, value) in entries {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn index_meta(&self) -> Result<Option<IndexMeta>> {
        let rows = sqlx::query("SELECT key, value FROM index_meta")
            .fetch_all(&self.pool)
            .await?;
        let mut model = None;
        let mut dims = None;
        let mut metric = None;
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            match key.as_str() {
                "embedding_model" => model = Some(value),
                "dims" => dims = value.parse::<usize>().ok(),
                "metric" => {
                    metric = match value.as_str() {
                        "cosine" => Some(Metric::Cosine),
                        "l2" => Some(Metric::L2),
                        _ => None,
                    }
                }
                _ => {}
            }
        }
        match (model, dims, metric) {
            (Some(embedding_model), Some(dims), Some(metric)) => Ok(Some(IndexMeta {
                embedding_model,
                dims,
                metric,
            })),
            (None, None, None) => Ok(None),
            _ => Err(AssistantError::IndexConsistency {
                course_id: self.course_id.clone(),
                message: "index_meta is incomplete".to_string(),
            }),
        }
    }

    async fn replace_document(
        &self,
        write: &DocumentWrite,
        retire: &[String],
        meta: &IndexMeta,
    ) -> Result<()> {
        let doc = &write.document;
        let mut tx = self.pool.begin().await?;

        delete_document_rows(&mut tx, &doc.doc_id).await?;
        for old in retire.iter().filter(|id| **id != doc.doc_id) {
            delete_document_rows(&mut tx, old).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, file_type, file_name, storage_path, title,
                                   total_units, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.doc_id)
        .bind(doc.file_type.as_str())
        .bind(&doc.file_name)
        .bind(&doc.storage_path)
        .bind(&doc.title)
        .bind(doc.total_units as i64)
        .bind(doc.ingested_at)
        .execute(&mut *tx)
        .await?;

        for page in &write.pages {
            sqlx::query(
                "INSERT INTO pages (doc_id, number, page_or_slide, title, text) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&page.doc_id)
            .bind(page.number as i64)
            .bind(page.page_or_slide.map(|p| p as i64))
            .bind(&page.title)
            .bind(&page.text)
            .execute(&mut *tx)
            .await?;
        }

        for stored in &write.chunks {
            let c = &stored.chunk;
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, doc_id, seq, text, page_or_slide, title,
                                    span_start, span_end, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.chunk_id)
            .bind(&c.doc_id)
            .bind(c.seq as i64)
            .bind(&c.text)
            .bind(c.page_or_slide.map(|p| p as i64))
            .bind(&c.title)
            .bind(c.char_span.start as i64)
            .bind(c.char_span.end as i64)
            .bind(&c.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunk_vectors (chunk_id, doc_id, embedding) VALUES (?, ?, ?)")
                .bind(&c.chunk_id)
                .bind(&c.doc_id)
                .bind(vec_to_blob(&stored.vector))
                .execute(&mut *tx)
                .await?;
        }

        write_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_document(&self, doc_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_document_rows(&mut tx, doc_id).await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn load_all(&self) -> Result<(Vec<Document>, Vec<StoredChunk>)> {
        let doc_rows = sqlx::query("SELECT * FROM documents ORDER BY doc_id")
            .fetch_all(&self.pool)
            .await?;
        let documents = doc_rows
            .iter()
            .map(|row| self.document_from_row(row))
            .collect::<Result<Vec<_>>>()?;

        let chunk_rows = sqlx::query(
            r#"
            SELECT c.*, v.embedding
            FROM chunks c
            JOIN chunk_vectors v ON v.chunk_id = c.chunk_id
            ORDER BY c.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let chunks = chunk_rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                StoredChunk {
                    chunk: chunk_from_row(row),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect();

        Ok((documents, chunks))
    }

    async fn get_page(&self, doc_id: &str, number: u32) -> Result<Option<Page>> {
        let row = sqlx::query("SELECT * FROM pages WHERE doc_id = ? AND number = ?")
            .bind(doc_id)
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Page {
            doc_id: row.get("doc_id"),
            number: row.get::<i64, _>("number") as u32,
            page_or_slide: row.get::<Option<i64>, _>("page_or_slide").map(|p| p as u32),
            title: row.get("title"),
            text: row.get("text"),
        }))
    }

    async fn replace_vectors(
        &self,
        vectors: &[(String, Vec<f32>)],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (chunk_id, vector) in vectors {
            sqlx::query("UPDATE chunk_vectors SET embedding = ? WHERE chunk_id = ?")
                .bind(vec_to_blob(vector))
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        write_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }
}
