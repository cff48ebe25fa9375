//! Optional web search capability.
//!
//! Results are normalized to [`WebSnippet`]s. [`CachedWebSearch`] wraps any
//! provider with an in-process TTL cache keyed by `(query, k)`; only
//! successful lookups are cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::WebSearchConfig;
use crate::error::{AssistantError, Result};
use crate::http;

const TAVILY_URL: &str = "https://api.tavily.com/search";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSnippet {
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// Provider relevance score, 0 when the provider gives none.
    #[serde(default)]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

impl WebSnippet {
    /// Host part of the URL, or the URL itself if it does not parse.
    pub fn domain(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, k: usize) -> Result<Vec<WebSnippet>>;
}

pub struct TavilySearch {
    api_key: String,
    client: reqwest::Client,
    max_retries: u32,
}

impl TavilySearch {
    pub fn new(config: &WebSearchConfig) -> anyhow::Result<Self> {
        let Ok(api_key) = std::env::var(&config.api_key_env) else {
            bail!("{} environment variable not set", config.api_key_env);
        };
        Ok(Self {
            api_key,
            client: http::client(config.timeout_secs).map_err(anyhow::Error::msg)?,
            max_retries: config.max_retries,
        })
    }
}

fn parse_tavily_response(json: &serde_json::Value, k: usize) -> Result<Vec<WebSnippet>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| AssistantError::WebSearch("invalid response: missing results".to_string()))?;

    let field = |item: &serde_json::Value, keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| item.get(*k).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string()
    };

    Ok(results
        .iter()
        .take(k)
        .map(|item| WebSnippet {
            title: field(item, &["title", "name"]),
            url: field(item, &["url", "link"]),
            snippet: field(item, &["content", "snippet", "description"]),
            score: item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
            published_at: item
                .get("published_date")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
        .filter(|s| !s.url.is_empty())
        .collect())
}

#[async_trait]
impl WebSearch for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<WebSnippet>> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": k.clamp(1, 10),
            "search_depth": "basic",
            "include_answer": false,
            "include_images": false,
        });
        let json = http::post_json_with_retry(
            &self.client,
            TAVILY_URL,
            None,
            &body,
            self.max_retries,
            "web search",
        )
        .await
        .map_err(AssistantError::WebSearch)?;
        parse_tavily_response(&json, k)
    }
}

struct CacheEntry {
    expires: Instant,
    results: Vec<WebSnippet>,
}

pub struct CachedWebSearch {
    inner: Arc<dyn WebSearch>,
    ttl: Duration,
    cache: Mutex<HashMap<(String, usize), CacheEntry>>,
}

impl CachedWebSearch {
    pub fn new(inner: Arc<dyn WebSearch>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &(String, usize)) -> Option<Vec<WebSnippet>> {
        let mut cache = self.cache.lock().ok()?;
        let now = Instant::now();
        cache.retain(|_, e| e.expires > now);
        cache.get(key).map(|e| e.results.clone())
    }
}

#[async_trait]
impl WebSearch for CachedWebSearch {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<WebSnippet>> {
        let key = (query.trim().to_string(), k);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }
        let results = self.inner.search(query, k).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key,
                CacheEntry {
                    expires: Instant::now() + self.ttl,
                    results: results.clone(),
                },
            );
        }
        Ok(results)
    }
}

/// `None` when web search is disabled.
pub fn create_web_search(config: &WebSearchConfig) -> anyhow::Result<Option<Arc<dyn WebSearch>>> {
    let provider: Arc<dyn WebSearch> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "tavily" => Arc::new(TavilySearch::new(config)?),
        other => bail!("Unknown web search provider: {}", other),
    };
    Ok(Some(Arc::new(CachedWebSearch::new(
        provider,
        Duration::from_secs(config.cache_ttl_secs),
    ))))
}
