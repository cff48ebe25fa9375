use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Per-course prompt overrides, keyed by course id.
    #[serde(default)]
    pub courses: HashMap<String, CourseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl StorageConfig {
    pub fn courses_dir(&self) -> PathBuf {
        self.data_dir.join("courses")
    }

    pub fn course_dir(&self, course_id: &str) -> PathBuf {
        self.courses_dir().join(course_id)
    }

    pub fn conversations_db(&self) -> PathBuf {
        self.data_dir.join("conversations.sqlite")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_csv_rows_per_unit")]
    pub csv_rows_per_unit: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            csv_rows_per_unit: default_csv_rows_per_unit(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_csv_rows_per_unit() -> usize {
    20
}

/// Distance metric of a course index. Fixed for the lifetime of the index.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::L2 => "l2",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates scoring below this are dropped.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// A top hit at or above this answers from course material alone.
    #[serde(default = "default_confident_score")]
    pub confident_score: f32,
    #[serde(default)]
    pub metric: Metric,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            confident_score: default_confident_score(),
            metric: Metric::default(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.25
}
fn default_confident_score() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `openai` (default api.openai.com) or `ollama` (default localhost:11434).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Prior turns included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_history_max_chars")]
    pub history_max_chars: usize,
    /// Ask the generator whether a question is time-sensitive before routing.
    #[serde(default)]
    pub llm_route_classifier: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            base_url: default_generation_base_url(),
            api_key_env: default_generation_key_env(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
            history_turns: default_history_turns(),
            history_max_chars: default_history_max_chars(),
            llm_route_classifier: false,
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generation_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_history_turns() -> usize {
    6
}
fn default_history_max_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    #[serde(default = "default_web_provider")]
    pub provider: String,
    #[serde(default = "default_web_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_web_max_results")]
    pub max_results: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_web_max_retries")]
    pub max_retries: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: default_web_provider(),
            api_key_env: default_web_key_env(),
            max_results: default_web_max_results(),
            cache_ttl_secs: default_cache_ttl_secs(),
            timeout_secs: default_web_timeout_secs(),
            max_retries: default_web_max_retries(),
        }
    }
}

fn default_web_provider() -> String {
    "disabled".to_string()
}
fn default_web_key_env() -> String {
    "TAVILY_API_KEY".to_string()
}
fn default_web_max_results() -> usize {
    5
}
fn default_cache_ttl_secs() -> u64 {
    1200
}
fn default_web_timeout_secs() -> u64 {
    8
}
fn default_web_max_retries() -> u32 {
    1
}

impl WebSearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_max_resident_courses")]
    pub max_resident_courses: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_resident_courses: default_max_resident_courses(),
        }
    }
}

fn default_max_resident_courses() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CourseConfig {
    /// One of `math`, `programming`, `engineering`, `humanities`.
    #[serde(default)]
    pub discipline: Option<String>,
    /// Extra instructions appended to the system prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Config {
    /// A config rooted at `data_dir` with every other setting at its default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
            },
            ..Self::default()
        }
    }

    pub fn course(&self, course_id: &str) -> Option<&CourseConfig> {
        self.courses.get(course_id)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }
    if config.chunking.csv_rows_per_unit == 0 {
        anyhow::bail!("chunking.csv_rows_per_unit must be > 0");
    }

    // Retrieval
    let r = &config.retrieval;
    if r.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.min_score) || !(0.0..=1.0).contains(&r.confident_score) {
        anyhow::bail!("retrieval.min_score and retrieval.confident_score must be in [0.0, 1.0]");
    }
    if r.min_score > r.confident_score {
        anyhow::bail!("retrieval.min_score must be <= retrieval.confident_score");
    }

    // Embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "hash" | "disabled" => {}
        "openai" | "ollama" | "local" => {
            if e.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
            other
        ),
    }
    if e.provider == "openai" && e.dims.map_or(true, |d| d == 0) {
        anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
    }
    if e.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Generation
    match config.generation.provider.as_str() {
        "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or disabled.",
            other
        ),
    }

    // Web search
    match config.web_search.provider.as_str() {
        "tavily" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown web_search provider: '{}'. Must be tavily or disabled.",
            other
        ),
    }

    if config.registry.max_resident_courses == 0 {
        anyhow::bail!("registry.max_resident_courses must be >= 1");
    }

    for course_id in config.courses.keys() {
        crate::error::validate_course_id(course_id)
            .with_context(|| format!("invalid [courses] entry '{course_id}'"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.metric, Metric::Cosine);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.generation.history_turns, 6);
        assert!(!config.web_search.is_enabled());
        assert_eq!(config.web_search.max_retries, 1);
        assert_eq!(WebSearchConfig::default().max_retries, 1);
    }

    #[test]
    fn parses_course_overrides() {
        let config: Config = toml::from_str(
            r#"
[storage]
data_dir = "/tmp/ellie"

[retrieval]
metric = "l2"

[courses."15-122"]
discipline = "programming"
instructions = "Use C0 syntax."
"#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.retrieval.metric, Metric::L2);
        let course = config.course("15-122").unwrap();
        assert_eq!(course.discipline.as_deref(), Some("programming"));
        assert_eq!(
            config.storage.course_dir("15-122"),
            PathBuf::from("/tmp/ellie/courses/15-122")
        );
    }

    #[test]
    fn example_config_is_valid() {
        let config: Config =
            toml::from_str(include_str!("../config/ellie.example.toml")).unwrap();
        validate(&config).unwrap();
        assert!(config.course("15-122").is_some());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_window() {
        let config: Config =
            toml::from_str("[chunking]\nchunk_chars = 100\noverlap_chars = 100\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config: Config =
            toml::from_str("[retrieval]\nmin_score = 0.8\nconfident_score = 0.5\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_unknown_providers() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"magic\"\n").unwrap();
        assert!(validate(&config).is_err());
        let config: Config = toml::from_str("[web_search]\nprovider = \"bing\"\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_bad_course_keys() {
        let config: Config =
            toml::from_str("[courses.\"../etc\"]\ndiscipline = \"math\"\n").unwrap();
        assert!(validate(&config).is_err());
    }
}
