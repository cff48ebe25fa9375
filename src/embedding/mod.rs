//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: feature-hashing bag of words. Offline and deterministic; the default.
//! - **[`OpenAIEmbedder`]**: calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models in-process via fastembed (`local-embeddings` feature).
//! - **[`DisabledEmbedder`]**: always fails; used when embeddings are switched off.
//!
//! Also provides the vector helpers used by the course index:
//! - [`cosine_similarity`] and [`l2_distance`]
//! - [`vec_to_blob`] / [`blob_to_vec`] for little-endian `f32` BLOB storage
//!
//! Ingestion and querying must use the same model. Each course index records
//! [`Embedder::model_name`] and [`Embedder::dims`] on first write and refuses
//! to open with a different embedder.

#[cfg(feature = "local-embeddings")]
mod local;
mod remote;

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{AssistantError, Result};

#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedder;
pub use remote::{OllamaEmbedder, OpenAIEmbedder};

/// Maps text to fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier recorded in each index (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AssistantError::Embedding("empty embedding response".to_string()))
    }
}

/// `"model/dims"`, the identity an index is versioned by.
pub fn identity(embedder: &dyn Embedder) -> String {
    format!("{}/{}", embedder.model_name(), embedder.dims())
}

/// Check a provider response has one vector of the right size per input.
pub(crate) fn check_vectors(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(AssistantError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(AssistantError::Embedding(format!(
            "provider returned a {}-dimensional vector, expected {dims}",
            bad.len()
        )));
    }
    Ok(vectors)
}

// ============ Disabled ============

/// Always fails. Ingestion and retrieval are unavailable with this provider.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(AssistantError::Embedding(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Feature hashing ============

pub const DEFAULT_HASH_DIMS: usize = 512;

/// Bag-of-words feature hashing.
///
/// Tokens are whitespace-separated words, lowercased, with surrounding
/// punctuation stripped. Each token increments one of `dims` buckets chosen
/// by a 64-bit FNV-1a hash (stable across builds and platforms), and the
/// term-frequency vector is L2-normalized. The same text always produces the
/// same vector regardless of what else has been indexed.
pub struct HashEmbedder {
    dims: usize,
    model_name: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model_name: format!("feature-hash-fnv1a-{dims}"),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut tf = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            tf[(fnv1a(token.as_bytes()) % self.dims as u64) as usize] += 1.0;
        }
        normalize(&mut tf);
        tf
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMS)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] (`dims` default 512) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
/// | `"disabled"` | [`DisabledEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors or vectors of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Euclidean distance. Vectors of different lengths are infinitely far apart.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
