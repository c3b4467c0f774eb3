//! Reasoner Router
//!
//! Orders the configured providers (the configured default first, then local
//! before cloud) and fails over between them. Each attempt runs under its own
//! timeout: local providers get longer for model loading.

use super::{GenerationOptions, Message, Reasoner, ReasonerError, ReasonerOutput, Result};
use crate::config::ReasonerConfig;
use async_trait::async_trait;
use std::time::Duration;

/// Router that presents several providers as one `Reasoner`
pub struct ReasonerRouter {
    providers: Vec<Box<dyn Reasoner>>,
    default_provider: String,
    local_timeout: Duration,
    cloud_timeout: Duration,
}

impl ReasonerRouter {
    /// Create a new router
    ///
    /// # Arguments
    /// * `providers` - Available providers, in any order
    /// * `config` - Reasoner configuration (default provider, timeouts)
    pub fn new(providers: Vec<Box<dyn Reasoner>>, config: &ReasonerConfig) -> Self {
        Self {
            providers,
            default_provider: config.default_provider.clone(),
            local_timeout: Duration::from_secs(config.local_timeout_secs),
            cloud_timeout: Duration::from_secs(config.cloud_timeout_secs),
        }
    }

    /// Providers in attempt order
    pub fn rank_providers(&self) -> Vec<&dyn Reasoner> {
        let mut providers: Vec<&dyn Reasoner> =
            self.providers.iter().map(|b| b.as_ref()).collect();
        providers.sort_by_key(|p| (p.name() != self.default_provider, !p.is_local()));
        providers
    }

    /// Check the health of all registered providers
    /// Returns a list of (provider_name, is_healthy)
    pub async fn health_report(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name(), is_healthy));
        }
        results
    }

    fn timeout_for(&self, provider: &dyn Reasoner) -> Duration {
        if provider.is_local() {
            self.local_timeout
        } else {
            self.cloud_timeout
        }
    }
}

#[async_trait]
impl Reasoner for ReasonerRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn is_local(&self) -> bool {
        self.providers.iter().all(|p| p.is_local())
    }

    async fn generate(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<ReasonerOutput> {
        if self.providers.is_empty() {
            return Err(ReasonerError::ProviderUnavailable(
                "No reasoner providers configured".to_string(),
            ));
        }

        let mut last_error = None;
        for provider in self.rank_providers() {
            let timeout = self.timeout_for(provider);
            tracing::debug!(
                provider = provider.name(),
                timeout_s = timeout.as_secs(),
                "Attempting provider"
            );

            match tokio::time::timeout(timeout, provider.generate(messages, options)).await {
                Ok(Ok(output)) => {
                    tracing::debug!(provider = provider.name(), "Provider succeeded");
                    return Ok(output);
                }
                // A malformed answer is not a transport problem; another provider
                // would not fix it and the caller has a default for it.
                Ok(Err(e @ ReasonerError::ParseError(_))) => return Err(e),
                Ok(Err(e)) => {
                    tracing::warn!(provider = provider.name(), error = %e, "Provider failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        provider = provider.name(),
                        timeout_s = timeout.as_secs(),
                        "Provider timed out"
                    );
                    last_error = Some(ReasonerError::Timeout);
                }
            }
        }

        tracing::error!("All reasoner providers exhausted");
        Err(last_error.unwrap_or_else(|| {
            ReasonerError::ProviderUnavailable("All reasoner providers failed".to_string())
        }))
    }

    async fn check_health(&self) -> bool {
        for provider in &self.providers {
            if provider.check_health().await {
                return true;
            }
        }
        false
    }
}
