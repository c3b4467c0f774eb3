//! Tool call and parameter validation types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Argument mapping passed to a tool
pub type Arguments = BTreeMap<String, serde_json::Value>;

/// A single tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Arguments,
}

impl ToolCallRequest {
    /// Create a new request with no arguments
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: Arguments::new(),
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// Input to the schema-aware validation call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// Values already known to the caller (earlier results, user answers)
    #[serde(default)]
    pub context: Arguments,
}

/// Result of the schema-aware validation call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParamValidation {
    pub required_params: Vec<String>,
    pub provided_params: Vec<String>,
    pub missing_params: Vec<String>,
    pub is_valid: bool,
    pub categorization: ParamCategorization,
}

/// How each missing parameter can be remediated
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParamCategorization {
    #[serde(default)]
    pub resolvable: Vec<ResolvableParam>,
    #[serde(default)]
    pub can_infer: Vec<InferableParam>,
    #[serde(default)]
    pub must_ask_user: Vec<String>,
}

impl ParamCategorization {
    /// Total number of categorized parameters
    pub fn len(&self) -> usize {
        self.resolvable.len() + self.can_infer.len() + self.must_ask_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A missing parameter obtainable by calling another tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvableParam {
    pub param: String,
    pub suggested_tool: String,
    #[serde(default)]
    pub suggested_arguments: Arguments,
    /// Dotted path into the suggested tool's result, e.g. `0.id`
    pub extraction_path: String,
}

/// A missing parameter that can be safely defaulted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferableParam {
    pub param: String,
    pub value: serde_json::Value,
    pub reason: String,
}
