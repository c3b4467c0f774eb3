//! In-process Tool Runner
//!
//! Tools are plain closures registered next to their catalog entry. Every
//! invocation is recorded so callers can check what was called and with which
//! arguments.

use async_trait::async_trait;
use sdk::{
    errors::EngineError, Arguments, ToolCallRequest, ToolCatalog, ToolRunner, ToolSpec,
    WorkflowTemplate,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handler invoked for a tool call; `Err` becomes a tool error
pub type ToolHandler = Arc<dyn Fn(&Arguments) -> Result<Value, String> + Send + Sync>;

/// Tool Runner whose tools live in this process
#[derive(Default)]
pub struct InMemoryToolRunner {
    catalog: ToolCatalog,
    handlers: HashMap<String, ToolHandler>,
    calls: Mutex<Vec<ToolCallRequest>>,
}

impl InMemoryToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its handler
    pub fn with_tool<F>(mut self, spec: ToolSpec, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(spec.name.clone(), Arc::new(handler));
        self.catalog.tools.push(spec);
        self
    }

    /// Register a workflow template with its handler
    pub fn with_workflow<F>(mut self, template: WorkflowTemplate, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(template.name.clone(), Arc::new(handler));
        self.catalog.workflows.push(template);
        self
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<ToolCallRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls made to `tool_name`
    pub fn call_count(&self, tool_name: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|call| call.tool_name == tool_name).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ToolRunner for InMemoryToolRunner {
    async fn call_tool(&self, tool_name: &str, arguments: &Arguments) -> Result<Value, EngineError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ToolCallRequest {
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
            });
        }

        let handler = self
            .handlers
            .get(tool_name)
            .ok_or_else(|| EngineError::ToolNotFound(tool_name.to_string()))?;
        handler(arguments).map_err(EngineError::ToolError)
    }

    async fn catalog(&self) -> Result<ToolCatalog, EngineError> {
        Ok(self.catalog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::ParamSpec;
    use serde_json::json;

    fn runner() -> InMemoryToolRunner {
        InMemoryToolRunner::new()
            .with_tool(ToolSpec::new("list_facilities", "List"), |_| {
                Ok(json!([{"id": "f-1"}]))
            })
            .with_tool(
                ToolSpec::new("get_facility", "Get")
                    .with_required("facilityId", ParamSpec::of_type("string")),
                |args| {
                    args.get("facilityId")
                        .cloned()
                        .ok_or_else(|| "facilityId missing".to_string())
                },
            )
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let runner = runner();
        runner.call_tool("list_facilities", &Arguments::new()).await.unwrap();
        runner.call_tool("list_facilities", &Arguments::new()).await.unwrap();
        assert_eq!(runner.call_count("list_facilities"), 2);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_is_tool_error() {
        let err = runner()
            .call_tool("get_facility", &Arguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolError(msg) if msg.contains("facilityId")));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = runner().call_tool("nope", &Arguments::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_default_validation_uses_catalog() {
        let validation = runner()
            .validate_params("get_facility", &Arguments::new(), &Arguments::new())
            .await
            .unwrap();
        assert!(!validation.is_valid);
        assert_eq!(validation.categorization.resolvable[0].suggested_tool, "list_facilities");
    }
}
