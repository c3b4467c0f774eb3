//! Tool catalog types
//!
//! The catalog is what the Tool Runner advertises: every tool with its
//! JSON-schema parameter set, plus the named workflow templates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full catalog exposed by a Tool Runner
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCatalog {
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub workflows: Vec<WorkflowTemplate>,
}

impl ToolCatalog {
    /// Create a catalog from tools and workflow templates
    pub fn new(tools: Vec<ToolSpec>, workflows: Vec<WorkflowTemplate>) -> Self {
        Self { tools, workflows }
    }

    /// Get a tool entry by exact name
    pub fn get_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Get a workflow template by exact name
    pub fn get_workflow(&self, name: &str) -> Option<&WorkflowTemplate> {
        self.workflows.iter().find(|wf| wf.name == name)
    }

    /// Whether `action` names a tool or a workflow template
    pub fn has_action(&self, action: &str) -> bool {
        self.get_tool(action).is_some() || self.get_workflow(action).is_some()
    }

    /// Resolve an action name to its catalog form.
    ///
    /// Exact matches win. Otherwise an ecosystem prefix such as `github.` or
    /// `mcp__server__` is stripped and the bare name is returned if it matches
    /// exactly. Returns `None` when neither form is known.
    pub fn normalize_action(&self, action: &str) -> Option<String> {
        if self.has_action(action) {
            return Some(action.to_string());
        }
        let bare = strip_namespace(action);
        if bare != action && self.has_action(bare) {
            return Some(bare.to_string());
        }
        None
    }

    /// Names of all tools followed by all workflow templates
    pub fn action_names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|t| t.name.as_str())
            .chain(self.workflows.iter().map(|w| w.name.as_str()))
            .collect()
    }

    /// Parse a catalog from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the catalog to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Strip a dotted or double-underscore namespace prefix from a tool name.
pub fn strip_namespace(name: &str) -> &str {
    let after_dot = name.rsplit('.').next().unwrap_or(name);
    after_dot.rsplit("__").next().unwrap_or(after_dot)
}

/// A single tool advertised by the Tool Runner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: InputSchema,
}

impl ToolSpec {
    /// Create a tool spec with an empty schema
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::default(),
        }
    }

    /// Add a required parameter
    pub fn with_required(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        let name = name.into();
        self.input_schema.required.push(name.clone());
        self.input_schema.properties.insert(name, spec);
        self
    }

    /// Add an optional parameter
    pub fn with_optional(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.input_schema.properties.insert(name.into(), spec);
        self
    }

    /// Whether the tool's name reads as a listing, search or lookup verb
    pub fn is_lookup(&self) -> bool {
        is_lookup_action(&self.name)
    }
}

/// Whether an action name starts with (or contains) a listing/search/lookup verb
pub fn is_lookup_action(action: &str) -> bool {
    const LOOKUP_VERBS: &[&str] = &["list", "search", "find", "lookup", "query", "get_all"];
    let lower = strip_namespace(action).to_lowercase();
    LOOKUP_VERBS.iter().any(|verb| lower.contains(verb))
}

/// JSON-schema object describing a tool's parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// A single parameter entry of an input schema
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl ParamSpec {
    /// Create a parameter spec of the given JSON type
    pub fn of_type(param_type: impl Into<String>) -> Self {
        Self {
            param_type: param_type.into(),
            ..Default::default()
        }
    }

    /// Attach a description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach a default value
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach an enum value set
    pub fn with_enum(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    /// Attach a string format (e.g. `date-time`)
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Named multi-tool workflow template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: InputSchema,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new(
            vec![
                ToolSpec::new("list_facilities", "List facilities"),
                ToolSpec::new("get_facility", "Get one facility")
                    .with_required("facilityId", ParamSpec::of_type("string")),
            ],
            vec![WorkflowTemplate {
                name: "facility_report".to_string(),
                description: "Report".to_string(),
                input_schema: InputSchema::default(),
            }],
        )
    }

    #[test]
    fn test_normalize_exact_match() {
        let catalog = catalog();
        assert_eq!(
            catalog.normalize_action("get_facility").as_deref(),
            Some("get_facility")
        );
        assert_eq!(
            catalog.normalize_action("facility_report").as_deref(),
            Some("facility_report")
        );
    }

    #[test]
    fn test_normalize_strips_namespace() {
        let catalog = catalog();
        assert_eq!(
            catalog.normalize_action("acme.facilities.get_facility").as_deref(),
            Some("get_facility")
        );
        assert_eq!(
            catalog.normalize_action("mcp__acme__list_facilities").as_deref(),
            Some("list_facilities")
        );
        assert_eq!(catalog.normalize_action("acme.delete_facility"), None);
    }

    #[test]
    fn test_lookup_verbs() {
        assert!(is_lookup_action("list_facilities"));
        assert!(is_lookup_action("acme.search_orders"));
        assert!(is_lookup_action("lookupUser"));
        assert!(!is_lookup_action("get_facility"));
        assert!(!is_lookup_action("create_order"));
    }

    #[test]
    fn test_schema_round_trip_uses_json_schema_names() {
        let json = r#"{
            "tools": [{
                "name": "get_facility",
                "description": "Get one",
                "inputSchema": {
                    "properties": {"facilityId": {"type": "string", "description": "id"}},
                    "required": ["facilityId"]
                }
            }]
        }"#;
        let catalog = ToolCatalog::from_json(json).unwrap();
        let tool = catalog.get_tool("get_facility").unwrap();
        assert_eq!(tool.input_schema.required, vec!["facilityId"]);
        assert_eq!(tool.input_schema.properties["facilityId"].param_type, "string");
        assert!(catalog.workflows.is_empty());
    }
}
