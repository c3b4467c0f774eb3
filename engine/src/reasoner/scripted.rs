//! Scripted reasoner
//!
//! Deterministic `Reasoner` that answers from a fixed script. Each rule pairs a
//! needle with a reply; the first rule whose needle occurs in the conversation
//! wins. Used throughout the test suite.

use super::{
    parse_json_object, GenerationOptions, Message, Reasoner, ReasonerError, ReasonerOutput,
    Result,
};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

/// A reasoner driven by substring-matched canned replies
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    rules: Vec<(String, Reply)>,
    fallback: Option<Reply>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` whenever `needle` occurs in any message
    pub fn respond(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Text(text.into())));
        self
    }

    /// Fail with a network error whenever `needle` occurs in any message
    pub fn fail_on(mut self, needle: impl Into<String>, error: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Fail(error.into())));
        self
    }

    /// Reply used when no rule matches
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(Reply::Text(text.into()));
        self
    }

    /// Every conversation received so far
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn pick(&self, messages: &[Message]) -> Option<Reply> {
        self.rules
            .iter()
            .find(|(needle, _)| messages.iter().any(|m| m.content.contains(needle.as_str())))
            .map(|(_, reply)| reply.clone())
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<ReasonerOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }

        match self.pick(messages) {
            Some(Reply::Text(text)) if options.structured_output => {
                Ok(ReasonerOutput::Json(parse_json_object(&text)?))
            }
            Some(Reply::Text(text)) => Ok(ReasonerOutput::Text(text)),
            Some(Reply::Fail(error)) => Err(ReasonerError::NetworkError(error)),
            None => Err(ReasonerError::ProviderUnavailable(
                "no scripted reply".to_string(),
            )),
        }
    }
}
