//! Document viewer operations over an ingested course document.

use serde::Serialize;

use crate::error::{AssistantError, Result};
use crate::index::CourseIndex;
use crate::models::{Document, FileType, Page};

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub file_name: String,
    pub file_type: FileType,
    pub title: Option<String>,
    pub storage_path: String,
    /// Pages for PDF, slides for PPTX, sections or row groups otherwise.
    pub total_pages: u32,
    pub chunks: usize,
    /// The requested page, when it exists.
    pub page: Option<Page>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedPage {
    Text {
        page: u32,
        title: Option<String>,
        text: String,
    },
    File {
        mime: &'static str,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
}

fn document(index: &CourseIndex, doc_id: &str) -> Result<Document> {
    index.document(doc_id)?.ok_or_else(|| AssistantError::NotFound {
        what: "document",
        id: doc_id.to_string(),
    })
}

pub async fn get_document_metadata(
    index: &CourseIndex,
    doc_id: &str,
    page: Option<u32>,
) -> Result<DocumentMetadata> {
    let doc = document(index, doc_id)?;
    let page = match page {
        Some(n) => index.get_page(doc_id, n).await?,
        None => None,
    };
    Ok(DocumentMetadata {
        chunks: index.chunks_of(doc_id)?.len(),
        doc_id: doc.doc_id,
        file_name: doc.file_name,
        file_type: doc.file_type,
        title: doc.title,
        storage_path: doc.storage_path,
        total_pages: doc.total_units,
        page,
    })
}

/// Stored text and title of page `page` (1-based).
pub async fn get_page_content(index: &CourseIndex, doc_id: &str, page: u32) -> Result<Page> {
    let doc = document(index, doc_id)?;
    if page == 0 || page > doc.total_units {
        return Err(AssistantError::PageOutOfRange {
            page,
            total: doc.total_units,
        });
    }
    index
        .get_page(doc_id, page)
        .await?
        .ok_or_else(|| AssistantError::IndexConsistency {
            course_id: index.course_id().to_string(),
            message: format!("document {doc_id} has no stored page {page}"),
        })
}

/// Text of one page for paged formats; the original file otherwise.
pub async fn render_page(index: &CourseIndex, doc_id: &str, page: u32) -> Result<RenderedPage> {
    let doc = document(index, doc_id)?;
    if doc.file_type.is_paged() {
        let p = get_page_content(index, doc_id, page).await?;
        return Ok(RenderedPage::Text {
            page: p.number,
            title: p.title,
            text: p.text,
        });
    }
    let bytes = tokio::fs::read(&doc.storage_path).await?;
    Ok(RenderedPage::File {
        mime: doc.file_type.mime(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{CharSpan, ChunkDraft};
    use crate::store::MemoryChunkStore;
    use std::sync::Arc;

    async fn index_with(file_type: FileType, storage_path: String) -> CourseIndex {
        let index = CourseIndex::open(
            "CS101",
            Arc::new(MemoryChunkStore::new()),
            Arc::new(HashEmbedder::new(32)),
            crate::config::Metric::Cosine,
            16,
        )
        .await
        .unwrap();
        let pages = (1..=2)
            .map(|n| Page {
                doc_id: "d1".into(),
                number: n,
                page_or_slide: Some(n),
                title: Some(format!("Slide {n}")),
                text: format!("content of slide {n}"),
            })
            .collect();
        let drafts = vec![ChunkDraft {
            unit_index: 0,
            text: "content of slide 1".into(),
            page_or_slide: Some(1),
            title: Some("Slide 1".into()),
            char_span: CharSpan { start: 0, end: 18 },
        }];
        let doc = Document {
            doc_id: "d1".into(),
            course_id: "CS101".into(),
            file_type,
            file_name: "deck.pptx".into(),
            storage_path,
            title: Some("Slide 1".into()),
            total_units: 2,
            ingested_at: 0,
        };
        index.add_document(doc, pages, &drafts).await.unwrap();
        index
    }

    #[tokio::test]
    async fn metadata_includes_requested_page() {
        let index = index_with(FileType::Pptx, String::new()).await;
        let meta = get_document_metadata(&index, "d1", Some(2)).await.unwrap();
        assert_eq!(meta.total_pages, 2);
        assert_eq!(meta.chunks, 1);
        assert_eq!(meta.page.unwrap().text, "content of slide 2");
        let none = get_document_metadata(&index, "d1", Some(9)).await.unwrap();
        assert!(none.page.is_none());
    }

    #[tokio::test]
    async fn page_bounds_are_checked() {
        let index = index_with(FileType::Pptx, String::new()).await;
        assert!(matches!(
            get_page_content(&index, "d1", 0).await,
            Err(AssistantError::PageOutOfRange { page: 0, total: 2 })
        ));
        assert!(matches!(
            get_page_content(&index, "d1", 3).await,
            Err(AssistantError::PageOutOfRange { page: 3, total: 2 })
        ));
        assert!(matches!(
            get_page_content(&index, "nope", 1).await,
            Err(AssistantError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn paged_documents_render_as_text() {
        let index = index_with(FileType::Pptx, String::new()).await;
        match render_page(&index, "d1", 1).await.unwrap() {
            RenderedPage::Text { page, title, text } => {
                assert_eq!(page, 1);
                assert_eq!(title.as_deref(), Some("Slide 1"));
                assert_eq!(text, "content of slide 1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_documents_render_as_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("d1.txt");
        std::fs::write(&path, b"plain notes").unwrap();
        let index = index_with(FileType::Txt, path.to_string_lossy().into_owned()).await;
        match render_page(&index, "d1", 1).await.unwrap() {
            RenderedPage::File { mime, bytes } => {
                assert_eq!(mime, "text/plain");
                assert_eq!(bytes, b"plain notes");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
