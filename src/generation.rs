//! Answer generator capability.
//!
//! A [`Generator`] turns a [`Prompt`] (plus an optional image, sent as a
//! separate multimodal part) into free text. Provider failures surface as
//! [`AssistantError::Generation`]; the assistant turns those into
//! [`APOLOGY`] rather than showing raw provider errors.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use base64::Engine;

use crate::config::GenerationConfig;
use crate::error::{AssistantError, Result};
use crate::http;
use crate::models::{ImageInput, Role};

/// Shown in place of an answer when generation fails.
pub const APOLOGY: &str =
    "I'm sorry, I encountered an error while processing your question. Please try again.";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTurn {
    pub role: Role,
    pub content: String,
}

/// A fully assembled chat prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    /// Prior turns, oldest first.
    pub history: Vec<PromptTurn>,
    /// Context block and question.
    pub user: String,
}

impl Prompt {
    /// A one-shot prompt with no history.
    pub fn single(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            user: user.into(),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &Prompt, image: Option<&ImageInput>) -> Result<String>;
}

/// Always fails; used when no generation provider is configured.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &Prompt, _image: Option<&ImageInput>) -> Result<String> {
        Err(AssistantError::Generation(
            "generation provider is disabled".to_string(),
        ))
    }
}

/// Any OpenAI-compatible `POST {base_url}/chat/completions` API
/// (OpenAI, Groq, a local vLLM or llama.cpp server, ...).
pub struct OpenAiChatGenerator {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiChatGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let Ok(api_key) = std::env::var(&config.api_key_env) else {
            bail!("{} environment variable not set", config.api_key_env);
        };
        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs).map_err(anyhow::Error::msg)?,
        })
    }
}

/// Build the `messages` array of a chat completion request.
pub fn chat_messages(prompt: &Prompt, image: Option<&ImageInput>) -> serde_json::Value {
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": prompt.system,
    })];
    for turn in &prompt.history {
        messages.push(serde_json::json!({
            "role": turn.role.as_str(),
            "content": turn.content,
        }));
    }
    let user = match image {
        Some(img) => {
            let data = base64::engine::general_purpose::STANDARD.encode(&img.bytes);
            serde_json::json!([
                {"type": "text", "text": prompt.user},
                {"type": "image_url", "image_url": {"url": format!("data:{};base64,{}", img.mime, data)}}
            ])
        }
        None => serde_json::Value::String(prompt.user.clone()),
    };
    messages.push(serde_json::json!({"role": "user", "content": user}));
    serde_json::Value::Array(messages)
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AssistantError::Generation("invalid chat response: missing choices[0].message.content".to_string())
        })
}

#[async_trait]
impl Generator for OpenAiChatGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt, image: Option<&ImageInput>) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": chat_messages(prompt, image),
        });
        let json = http::post_json_with_retry(
            &self.client,
            &format!("{}/chat/completions", self.base_url),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "chat completion",
        )
        .await
        .map_err(AssistantError::Generation)?;
        parse_chat_response(&json)
    }
}

/// | Config Value | Generator |
/// |-------------|-----------|
/// | `"openai"` | [`OpenAiChatGenerator`] |
/// | `"disabled"` | [`DisabledGenerator`] |
pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatGenerator::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
