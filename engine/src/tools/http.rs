//! HTTP Tool Runner client
//!
//! Endpoints:
//! - `POST /tools/call` with `{toolName, arguments}`
//! - `GET /tools` and `GET /workflows` for the catalog
//! - `POST /tools/validate` with `{toolName, arguments, context}`
//!
//! Runners that do not implement `/tools/validate` (404/405) are validated
//! locally against their catalog instead.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use sdk::{
    errors::EngineError, Arguments, ParamValidation, ToolCallRequest, ToolCatalog, ToolRunner,
    ToolSpec, ValidationRequest, WorkflowTemplate,
};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ToolRunnerConfig;

/// Tool Runner reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpToolRunner {
    base_url: String,
    client: Client,
}

/// `GET /tools` answers either a bare list or `{"tools": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum ToolsBody {
    Wrapped { tools: Vec<ToolSpec> },
    Bare(Vec<ToolSpec>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkflowsBody {
    Wrapped { workflows: Vec<WorkflowTemplate> },
    Bare(Vec<WorkflowTemplate>),
}

impl HttpToolRunner {
    pub fn new(config: &ToolRunnerConfig) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_connect() || e.is_timeout() {
            EngineError::ToolRunnerUnavailable(format!("{}: {}", self.base_url, e))
        } else {
            EngineError::ToolError(e.to_string())
        }
    }

    async fn fetch_workflows(&self) -> Result<Vec<WorkflowTemplate>, EngineError> {
        let response = self
            .client
            .get(self.url("/workflows"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(EngineError::ToolRunnerUnavailable(format!(
                "GET /workflows returned {}",
                response.status()
            )));
        }

        let body: WorkflowsBody = response
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("Malformed workflow list: {}", e)))?;
        Ok(match body {
            WorkflowsBody::Wrapped { workflows } | WorkflowsBody::Bare(workflows) => workflows,
        })
    }
}

#[async_trait]
impl ToolRunner for HttpToolRunner {
    async fn call_tool(&self, tool_name: &str, arguments: &Arguments) -> Result<Value, EngineError> {
        let request = ToolCallRequest {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        };
        debug!(tool = tool_name, "Calling tool runner");

        let response = self
            .client
            .post(self.url("/tools/call"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(EngineError::ToolNotFound(tool_name.to_string()));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ToolError(format!("{} ({}): {}", tool_name, status, text)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("Malformed tool result: {}", e)))?;

        match body {
            Value::Object(mut map) => {
                if let Some(result) = map.remove("result") {
                    Ok(result)
                } else if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
                    let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                    Err(EngineError::ToolError(message))
                } else {
                    Ok(Value::Object(map))
                }
            }
            other => Ok(other),
        }
    }

    async fn catalog(&self) -> Result<ToolCatalog, EngineError> {
        let response = self
            .client
            .get(self.url("/tools"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(EngineError::ToolRunnerUnavailable(format!(
                "GET /tools returned {}",
                response.status()
            )));
        }

        let body: ToolsBody = response
            .json()
            .await
            .map_err(|e| EngineError::ToolError(format!("Malformed tool list: {}", e)))?;
        let tools = match body {
            ToolsBody::Wrapped { tools } | ToolsBody::Bare(tools) => tools,
        };

        let workflows = self.fetch_workflows().await?;
        debug!(tools = tools.len(), workflows = workflows.len(), "Fetched catalog");
        Ok(ToolCatalog::new(tools, workflows))
    }

    async fn validate_params(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &Arguments,
    ) -> Result<ParamValidation, EngineError> {
        let request = ValidationRequest {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            context: context.clone(),
        };

        let response = self
            .client
            .post(self.url("/tools/validate"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => {
                warn!(tool = tool_name, "Runner has no validation endpoint, validating locally");
                let catalog = self.catalog().await?;
                sdk::validation::validate_arguments(&catalog, &request)
            }
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| EngineError::ToolError(format!("Malformed validation result: {}", e))),
            status => Err(EngineError::ToolError(format!(
                "POST /tools/validate returned {}",
                status
            ))),
        }
    }
}
