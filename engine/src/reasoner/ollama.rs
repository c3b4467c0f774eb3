//! Ollama Reasoner Provider
//!
//! Implements the `Reasoner` trait for Ollama, a local model server typically
//! listening at http://localhost:11434.
//!
//! Structured calls set `format: "json"` so the server constrains the output to
//! a JSON object; the content is still scanned defensively before decoding.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    parse_json_object, GenerationOptions, Message, Reasoner, ReasonerError, ReasonerOutput,
    Result,
};

/// Ollama provider configuration
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// Model name to use (e.g., "llama3.1:8b")
    model: String,

    /// HTTP client for API requests
    client: Client,
}

impl OllamaProvider {
    /// Create a new Ollama provider
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (e.g., "http://localhost:11434")
    /// * `model` - Model name to use (e.g., "llama3.1:8b")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Reasoner for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<ReasonerOutput> {
        let ollama_messages = self.convert_messages(messages);

        tracing::debug!(
            model = %self.model,
            messages = ollama_messages.len(),
            structured = options.structured_output,
            "Ollama request"
        );

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: ollama_messages,
            stream: false,
            format: options.structured_output.then(|| "json".to_string()),
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_output_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasonerError::Timeout
                } else if e.is_connect() {
                    ReasonerError::ProviderUnavailable(format!(
                        "Cannot connect to Ollama at {}. Is Ollama running?",
                        self.base_url
                    ))
                } else {
                    ReasonerError::NetworkError(e.to_string())
                }
            })?;

        tracing::debug!(
            elapsed_s = start.elapsed().as_secs_f64(),
            "Ollama response received"
        );

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ReasonerError::ProviderUnavailable(format!(
                "Ollama API error ({}): {}",
                status, error_text
            )));
        }

        let ollama_response: OllamaResponse = response.json().await.map_err(|e| {
            ReasonerError::ParseError(format!("Failed to parse Ollama response: {}", e))
        })?;

        let content = ollama_response.message.content;
        if options.structured_output {
            Ok(ReasonerOutput::Json(parse_json_object(&content)?))
        } else {
            Ok(ReasonerOutput::Text(content))
        }
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}

/// Ollama API request format
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama message format
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama API response format
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}
