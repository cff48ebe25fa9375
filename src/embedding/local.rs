//! In-process embeddings via fastembed. Models are downloaded from Hugging
//! Face on first use and cached; afterwards no network calls are made.

use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;

use super::{check_vectors, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{AssistantError, Result};

pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (fastembed_model, default_dims) = resolve_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn resolve_model(name: &str) -> anyhow::Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => (M::AllMiniLML6V2, 384),
        "bge-small-en-v1.5" => (M::BGESmallENV15, 384),
        "bge-base-en-v1.5" => (M::BGEBaseENV15, 768),
        "bge-large-en-v1.5" => (M::BGELargeENV15, 1024),
        "nomic-embed-text-v1.5" => (M::NomicEmbedTextV15, 768),
        "multilingual-e5-small" => (M::MultilingualE5Small, 384),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ),
    })
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let batch = texts.to_vec();
        let batch_size = self.batch_size;
        let expected = texts.len();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| AssistantError::Embedding("local model lock poisoned".to_string()))?;
            model
                .embed(batch, Some(batch_size))
                .map_err(|e| AssistantError::Embedding(format!("local embedding failed: {e}")))
        })
        .await
        .map_err(|e| AssistantError::Embedding(format!("local embedding task failed: {e}")))??;

        check_vectors(vectors, expected, self.dims)
    }
}
