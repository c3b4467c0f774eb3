use super::{
    parse_json_object, GenerationOptions, Message, Reasoner, ReasonerError, ReasonerOutput,
};
use crate::config::OpenAIConfig;
use async_trait::async_trait;
use serde_json::json;

/// OpenAI-compatible chat completions provider.
///
/// The API key is read from the environment variable named in the config
/// (`OPENAI_API_KEY` by default) when the provider is built.
pub struct OpenAIProvider {
    config: OpenAIConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: OpenAIConfig, api_key: Option<String>) -> Self {
        Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Reasoner for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn check_health(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> super::Result<ReasonerOutput> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ReasonerError::AuthenticationFailed(format!(
                "environment variable {} is not set",
                self.config.api_key_env
            ))
        })?;

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.to_string(),
                    "content": msg.content
                })
            })
            .collect();

        let mut payload = json!({
            "model": self.config.model,
            "messages": api_messages,
            "temperature": options.temperature,
            "max_tokens": options.max_output_tokens,
        });
        if options.structured_output {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasonerError::Timeout
                } else {
                    ReasonerError::NetworkError(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(ReasonerError::AuthenticationFailed(text));
            } else if status.as_u16() == 429 {
                return Err(ReasonerError::RateLimitExceeded);
            } else {
                return Err(ReasonerError::InvalidRequest(text));
            }
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ReasonerError::ParseError(e.to_string()))?;

        let content = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| ReasonerError::ParseError("No content in response".to_string()))?;

        if options.structured_output {
            Ok(ReasonerOutput::Json(parse_json_object(content)?))
        } else {
            Ok(ReasonerOutput::Text(content.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_authentication_failure() {
        let provider = OpenAIProvider::with_api_key(OpenAIConfig::default(), None);
        assert!(!provider.check_health().await);

        let err = provider
            .generate(&[Message::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReasonerError::AuthenticationFailed(_)));
    }
}
