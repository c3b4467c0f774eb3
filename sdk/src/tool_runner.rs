//! Tool Runner contract
//!
//! The engine never executes tools itself. Everything it needs from the
//! execution side goes through this trait: invoking a tool, reading the
//! catalog, and asking which parameters of a call are still missing.

use crate::catalog::ToolCatalog;
use crate::errors::EngineError;
use crate::types::{Arguments, ParamValidation, ValidationRequest};
use async_trait::async_trait;

/// Trait that all tool runner backends must implement
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Execute a tool (or workflow template) with the given arguments
    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Arguments,
    ) -> Result<serde_json::Value, EngineError>;

    /// Tools and workflow templates currently available
    async fn catalog(&self) -> Result<ToolCatalog, EngineError>;

    /// Schema-aware validation of a prospective call.
    ///
    /// The default implementation validates locally against [`Self::catalog`].
    async fn validate_params(
        &self,
        tool_name: &str,
        arguments: &Arguments,
        context: &Arguments,
    ) -> Result<ParamValidation, EngineError> {
        let catalog = self.catalog().await?;
        crate::validation::validate_arguments(
            &catalog,
            &ValidationRequest {
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
                context: context.clone(),
            },
        )
    }
}
