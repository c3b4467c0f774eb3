//! Schema-aware parameter validation
//!
//! Compares a tool call's arguments against the tool's input schema and sorts
//! every missing required parameter into exactly one remediation category:
//!
//! - **resolvable**: a listing/search tool in the catalog can produce it
//! - **can infer**: a default, enum value, timestamp or context value is safe
//! - **must ask user**: nothing can derive it safely
//!
//! This is the local implementation behind [`crate::ToolRunner::validate_params`];
//! remote runners may answer the same question themselves.

use crate::catalog::{InputSchema, ParamSpec, ToolCatalog, ToolSpec};
use crate::errors::EngineError;
use crate::types::{
    Arguments, InferableParam, ParamCategorization, ParamValidation, ResolvableParam,
    ValidationRequest,
};
use chrono::Utc;
use serde_json::Value;

/// Default extraction path for identifiers pulled out of listing results
pub const DEFAULT_EXTRACTION_PATH: &str = "0.id";

/// Validate a request against the catalog schema for its tool or workflow.
pub fn validate_arguments(
    catalog: &ToolCatalog,
    request: &ValidationRequest,
) -> Result<ParamValidation, EngineError> {
    let schema = schema_for(catalog, &request.tool_name)
        .ok_or_else(|| EngineError::ToolNotFound(request.tool_name.clone()))?;

    let required_params = schema.required.clone();
    let provided_params: Vec<String> = request
        .arguments
        .iter()
        .filter(|(_, value)| !is_blank(value))
        .map(|(name, _)| name.clone())
        .collect();

    let missing_params: Vec<String> = required_params
        .iter()
        .filter(|name| !provided_params.contains(name))
        .cloned()
        .collect();

    let mut categorization = ParamCategorization::default();
    for param in &missing_params {
        let spec = schema.properties.get(param);
        categorize(catalog, param, spec, &request.context, &mut categorization);
    }

    Ok(ParamValidation {
        is_valid: missing_params.is_empty(),
        required_params,
        provided_params,
        missing_params,
        categorization,
    })
}

fn schema_for<'a>(catalog: &'a ToolCatalog, action: &str) -> Option<&'a InputSchema> {
    catalog
        .get_tool(action)
        .map(|t| &t.input_schema)
        .or_else(|| catalog.get_workflow(action).map(|w| &w.input_schema))
}

fn categorize(
    catalog: &ToolCatalog,
    param: &str,
    spec: Option<&ParamSpec>,
    context: &Arguments,
    out: &mut ParamCategorization,
) {
    if let Some(value) = context.get(param).filter(|v| !is_blank(v)) {
        out.can_infer.push(InferableParam {
            param: param.to_string(),
            value: value.clone(),
            reason: "supplied by execution context".to_string(),
        });
        return;
    }

    if let Some(spec) = spec {
        if let Some(default) = &spec.default {
            out.can_infer.push(InferableParam {
                param: param.to_string(),
                value: default.clone(),
                reason: "schema default".to_string(),
            });
            return;
        }
        if let Some(first) = spec.enum_values.as_ref().and_then(|values| values.first()) {
            out.can_infer.push(InferableParam {
                param: param.to_string(),
                value: first.clone(),
                reason: "first enum value".to_string(),
            });
            return;
        }
    }

    if let Some(value) = infer_temporal(param, spec) {
        out.can_infer.push(InferableParam {
            param: param.to_string(),
            value,
            reason: "current time".to_string(),
        });
        return;
    }

    if let Some(entity) = identifier_entity(param) {
        if let Some(tool) = find_lookup_tool(catalog, &entity, context) {
            out.resolvable.push(ResolvableParam {
                param: param.to_string(),
                suggested_tool: tool.name.clone(),
                suggested_arguments: fill_from_context(&tool.input_schema, context),
                extraction_path: DEFAULT_EXTRACTION_PATH.to_string(),
            });
            return;
        }
    }

    out.must_ask_user.push(param.to_string());
}

/// Null, empty strings, and empty collections count as absent.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn infer_temporal(param: &str, spec: Option<&ParamSpec>) -> Option<Value> {
    let format = spec.and_then(|s| s.format.as_deref());
    let lower = param.to_lowercase();
    let now = Utc::now();

    match format {
        Some("date-time") => return Some(Value::String(now.to_rfc3339())),
        Some("date") => return Some(Value::String(now.format("%Y-%m-%d").to_string())),
        _ => {}
    }

    if lower.contains("time") || lower.ends_with("_at") || param.ends_with("At") {
        Some(Value::String(now.to_rfc3339()))
    } else if lower.contains("date") {
        Some(Value::String(now.format("%Y-%m-%d").to_string()))
    } else {
        None
    }
}

/// Entity named by an identifier-like parameter.
///
/// `facilityId` → `facility`, `order_id` → `order`, `id` → empty string.
/// Returns `None` when the name does not look like an identifier.
pub fn identifier_entity(param: &str) -> Option<String> {
    let stem = if param.eq_ignore_ascii_case("id") {
        ""
    } else if let Some(stem) = param.strip_suffix("_id") {
        stem
    } else if let Some(stem) = param.strip_suffix("Id") {
        stem
    } else if let Some(stem) = param.strip_suffix("ID") {
        stem
    } else {
        return None;
    };
    Some(to_snake_case(stem))
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn plural(stem: &str) -> String {
    if let Some(base) = stem.strip_suffix('y') {
        format!("{}ies", base)
    } else if stem.ends_with('s') {
        format!("{}es", stem)
    } else {
        format!("{}s", stem)
    }
}

fn find_lookup_tool<'a>(
    catalog: &'a ToolCatalog,
    entity: &str,
    context: &Arguments,
) -> Option<&'a ToolSpec> {
    let callable = |tool: &&ToolSpec| {
        tool.is_lookup()
            && tool
                .input_schema
                .required
                .iter()
                .all(|req| context.get(req).is_some_and(|v| !is_blank(v)))
    };

    if entity.is_empty() {
        let mut lookups = catalog.tools.iter().filter(callable);
        let first = lookups.next()?;
        return lookups.next().is_none().then_some(first);
    }

    let plural = plural(entity);
    let mut candidates: Vec<&ToolSpec> = catalog
        .tools
        .iter()
        .filter(callable)
        .filter(|tool| {
            let name = tool.name.to_lowercase();
            name.contains(&plural) || name.contains(entity)
        })
        .collect();
    candidates.sort_by_key(|tool| !tool.name.to_lowercase().starts_with("list"));
    candidates.into_iter().next()
}

fn fill_from_context(schema: &InputSchema, context: &Arguments) -> Arguments {
    schema
        .required
        .iter()
        .filter_map(|req| context.get(req).map(|v| (req.clone(), v.clone())))
        .collect()
}
