//! Reasoner Abstraction Layer
//!
//! This module provides a common interface for the language-model service the
//! conductor consults (Ollama, OpenAI-compatible endpoints). The `Reasoner`
//! trait defines the contract every provider implements, so the failover router
//! and the conductor stages work with any of them transparently.
//!
//! Stages never trust reasoner output blindly: structured calls are decoded
//! with serde into strict types, and a decode failure is a `ParseError` the
//! caller answers with a conservative default.

use crate::config::ReasonerConfig;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod ollama;
pub mod openai;
pub mod router;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

/// Result type for reasoner operations
pub type Result<T> = std::result::Result<T, ReasonerError>;

/// Errors that can occur during reasoner operations
#[derive(Debug, thiserror::Error)]
pub enum ReasonerError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<ReasonerError> for sdk::EngineError {
    fn from(err: ReasonerError) -> Self {
        match err {
            ReasonerError::Timeout => sdk::EngineError::ReasonerTimeout,
            other => sdk::EngineError::Reasoner(other.to_string()),
        }
    }
}

/// Message in a conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (system, user, assistant)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User message
    User,

    /// Assistant message
    Assistant,

    /// System message
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Generation options sent alongside every reasoner call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub structured_output: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 2048,
            structured_output: false,
        }
    }
}

impl GenerationOptions {
    /// Options requesting a JSON object response
    pub fn structured() -> Self {
        Self {
            structured_output: true,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn as_structured(mut self) -> Self {
        self.structured_output = true;
        self
    }
}

/// Response from a reasoner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReasonerOutput {
    /// Plain text
    Text(String),

    /// JSON object (only when structured output was requested)
    Json(serde_json::Value),
}

impl ReasonerOutput {
    /// Text form of the output
    pub fn into_text(self) -> String {
        match self {
            ReasonerOutput::Text(text) => text,
            ReasonerOutput::Json(value) => value.to_string(),
        }
    }

    /// JSON form of the output, scanning noisy text for the first object
    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            ReasonerOutput::Json(value) => Ok(value),
            ReasonerOutput::Text(text) => parse_json_object(&text),
        }
    }
}

/// Reasoner trait that all providers must implement
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai")
    fn name(&self) -> &str;

    /// Returns true if this is a local provider (e.g., Ollama)
    fn is_local(&self) -> bool {
        false
    }

    /// Generate a response
    ///
    /// # Arguments
    /// * `messages` - Ordered, role-tagged conversation
    /// * `options` - Temperature, output size and structured-output flag
    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<ReasonerOutput>;

    /// Check if the provider is currently healthy and available
    async fn check_health(&self) -> bool {
        true
    }
}

/// Build the failover router described by `config`.
///
/// Ollama is always registered; the OpenAI-compatible provider joins when it
/// is the default or its API key is set. An empty default provider means no
/// reasoner is configured, which is fatal for every stage.
pub fn from_config(
    config: &ReasonerConfig,
) -> std::result::Result<Arc<dyn Reasoner>, sdk::EngineError> {
    let default = config.default_provider.trim();
    if default.is_empty() {
        return Err(sdk::EngineError::ReasonerNotConfigured);
    }
    if !ReasonerConfig::PROVIDERS.contains(&default) {
        return Err(sdk::EngineError::Config(format!(
            "unknown reasoner provider '{}'",
            default
        )));
    }

    let mut providers: Vec<Box<dyn Reasoner>> = vec![Box::new(ollama::OllamaProvider::new(
        config.ollama.base_url.clone(),
        config.ollama.model.clone(),
    ))];
    let has_key = std::env::var(&config.openai.api_key_env).is_ok_and(|k| !k.trim().is_empty());
    if default == "openai" || has_key {
        providers.push(Box::new(openai::OpenAIProvider::new(config.openai.clone())));
    }

    tracing::info!(default, providers = providers.len(), "Reasoner router ready");
    Ok(Arc::new(router::ReasonerRouter::new(providers, config)))
}

/// Call the reasoner in structured mode and decode the answer into `T`.
///
/// Any transport error or undecodable object comes back as an error; stages
/// decide which conservative default replaces it.
pub async fn generate_structured<T: DeserializeOwned>(
    reasoner: &dyn Reasoner,
    messages: &[Message],
    options: &GenerationOptions,
) -> Result<T> {
    let options = options.clone().as_structured();
    let value = reasoner.generate(messages, &options).await?.into_json()?;
    serde_json::from_value(value)
        .map_err(|e| ReasonerError::ParseError(format!("Unexpected response shape: {}", e)))
}

/// Parse the first JSON object found in `content`.
///
/// Handles raw JSON, fenced code blocks (with trailing prose), and objects
/// embedded in prose.
pub fn parse_json_object(content: &str) -> Result<serde_json::Value> {
    let trimmed = content.trim();

    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(inner.trim()) {
            return Ok(value);
        }
    }

    for (pos, _) in trimmed.match_indices('{') {
        if let Some(candidate) = extract_balanced_json(&trimmed[pos..]) {
            if let Ok(value) = serde_json::from_str(candidate) {
                return Ok(value);
            }
        }
    }

    Err(ReasonerError::ParseError(
        "No JSON object found in reasoner output".to_string(),
    ))
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
