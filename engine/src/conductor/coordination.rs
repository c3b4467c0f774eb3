//! Inter-step coordination
//!
//! Before a step runs, parameters that point at earlier results
//! (`EXTRACT_FROM_STEP_1`, `{{step-1.id}}`) or still hold filler are replaced
//! with real values taken from `partial_results`. Plain extraction is tried
//! first; the reasoner is only asked when the result shape is not obvious.

use crate::conductor::context::ContextAssembler;
use crate::conductor::placeholder::PlaceholderPolicy;
use crate::conductor::types::{Critique, FindingCategory, Plan, PlanUpdate, Step, StepId};
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use crate::tools::extract_path;
use chrono::Utc;
use sdk::catalog::is_lookup_action;
use sdk::validation::{identifier_entity, is_blank};
use sdk::Arguments;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const COORDINATOR_INSTRUCTIONS: &str = "You are the parameter coordinator. A plan step \
needs a value that earlier steps produced. Find it in the results below.\n\
Respond with ONLY a JSON object: {\"found\": true|false, \"value\": <the value or null>}";

/// Parameters to run a step with, and the audit record if any changed
#[derive(Debug, Clone)]
pub struct Coordination {
    pub parameters: Arguments,
    pub update: Option<PlanUpdate>,
}

/// A reference that cannot be satisfied from the results so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationFailure {
    pub parameter: String,
    pub reason: String,
}

impl fmt::Display for CoordinationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot resolve '{}': {}", self.parameter, self.reason)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExtraction {
    found: bool,
    value: Option<Value>,
}

pub struct Coordinator {
    reasoner: Arc<dyn Reasoner>,
    policy: Arc<dyn PlaceholderPolicy>,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl Coordinator {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        policy: Arc<dyn PlaceholderPolicy>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            reasoner,
            policy,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    /// Parameters `step` should run with given the results so far.
    pub async fn coordinate(
        &self,
        step: &Step,
        plan: &Plan,
        partial_results: &BTreeMap<StepId, Value>,
        critique: &Critique,
    ) -> Result<Coordination, CoordinationFailure> {
        let mut parameters = step.parameters.clone();
        let mut reasons = Vec::new();

        for (name, value) in &step.parameters {
            if let Some(reference) = self.policy.back_reference(value) {
                let fail = |reason: String| CoordinationFailure {
                    parameter: name.clone(),
                    reason,
                };
                let source = reference
                    .resolve(plan)
                    .ok_or_else(|| fail(format!("step '{}' is not in the plan", reference.target)))?;
                if source.id == step.id {
                    return Err(fail(format!(
                        "step '{}' refers to its own result, which does not exist before it runs",
                        step.id
                    )));
                }
                let result = partial_results.get(&source.id).ok_or_else(|| {
                    fail(format!("step '{}' has not produced a result", source.id))
                })?;

                let resolved = match extract_value(result, reference.path.as_deref(), name) {
                    Some(v) => Some(v),
                    None => {
                        self.ask(step, name, &[(source.id.as_str(), result)])
                            .await
                    }
                };
                let resolved = resolved.ok_or_else(|| {
                    fail(format!("no usable value in the result of '{}'", source.id))
                })?;
                parameters.insert(name.clone(), resolved);
                reasons.push(format!("{} taken from the result of {}", name, source.id));
            } else if self.policy.is_placeholder(name, value) && !partial_results.is_empty() {
                let sources: Vec<(&str, &Value)> = partial_results
                    .iter()
                    .map(|(id, v)| (id.as_str(), v))
                    .collect();
                if let Some(resolved) = self.ask(step, name, &sources).await {
                    parameters.insert(name.clone(), resolved);
                    reasons.push(format!("{} replaced placeholder using earlier results", name));
                }
            }
        }

        for finding in critique.findings.iter().filter(|f| {
            f.step_id == step.id && f.category == FindingCategory::MustAskUser
        }) {
            let name = &finding.parameter_name;
            let usable = parameters
                .get(name)
                .is_some_and(|v| !is_blank(v) && !self.policy.is_placeholder(name, v));
            if usable {
                continue;
            }

            let lookups: Vec<(&str, &Value)> = plan
                .steps_before(&step.id)
                .into_iter()
                .rev()
                .filter(|s| is_lookup_action(&s.action))
                .filter_map(|s| partial_results.get(&s.id).map(|r| (s.id.as_str(), r)))
                .collect();
            if lookups.is_empty() {
                continue;
            }

            let found = lookups
                .iter()
                .find_map(|(id, result)| extract_value(result, None, name).map(|v| (*id, v)));
            let found = match found {
                Some(found) => Some(found),
                None => self.ask(step, name, &lookups).await.map(|v| ("earlier lookups", v)),
            };
            if let Some((source, value)) = found {
                parameters.insert(name.clone(), value);
                reasons.push(format!("{} filled from {}", name, source));
            }
        }

        let update = (parameters != step.parameters).then(|| PlanUpdate {
            step_id: step.id.clone(),
            before: step.parameters.clone(),
            after: parameters.clone(),
            reason: reasons.join("; "),
            at: Utc::now(),
        });
        if update.is_some() {
            debug!(step_id = %step.id, changes = reasons.len(), "Coordinated step parameters");
        }

        Ok(Coordination { parameters, update })
    }

    async fn ask(&self, step: &Step, parameter: &str, sources: &[(&str, &Value)]) -> Option<Value> {
        let results: BTreeMap<&str, &Value> = sources.iter().copied().collect();
        let messages = self.assembler.assemble(
            COORDINATOR_INSTRUCTIONS,
            &[
                (
                    "Step",
                    format!("{} ({}): {}", step.id, step.action, step.description),
                ),
                (
                    "Results",
                    serde_json::to_string_pretty(&results).unwrap_or_default(),
                ),
            ],
            &format!("What value should '{}' have?", parameter),
        );

        match generate_structured::<RawExtraction>(self.reasoner.as_ref(), &messages, &self.options)
            .await
        {
            Ok(RawExtraction {
                found: true,
                value: Some(value),
            }) if !is_blank(&value) && !self.policy.is_placeholder(parameter, &value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!(step_id = %step.id, parameter, error = %e, "Extraction request failed");
                None
            }
        }
    }
}

/// Pull a value for `param` out of a step result.
///
/// With a path, the value at that path. Otherwise the first record of the
/// result (the result itself, the first array element, or the first element
/// of an array field) supplies `param`, or `id` when `param` names an
/// identifier. A scalar result is used as-is.
pub fn extract_value(result: &Value, path: Option<&str>, param: &str) -> Option<Value> {
    if let Some(path) = path {
        return extract_path(result, path)
            .filter(|v| !is_blank(v))
            .cloned();
    }

    let field_of = |record: &Value| -> Option<Value> {
        let map = record.as_object()?;
        map.get(param)
            .or_else(|| identifier_entity(param).and_then(|_| map.get("id")))
            .filter(|v| !is_blank(v))
            .cloned()
    };

    match result {
        Value::Array(items) => items.first().and_then(|first| match first {
            Value::Object(_) => field_of(first),
            Value::String(_) | Value::Number(_) => Some(first.clone()),
            _ => None,
        }),
        Value::Object(map) => field_of(result).or_else(|| {
            map.values()
                .filter_map(|v| v.as_array().and_then(|items| items.first()))
                .find_map(field_of)
        }),
        Value::String(s) if !s.trim().is_empty() => Some(result.clone()),
        Value::Number(_) => Some(result.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::placeholder::DefaultPlaceholderPolicy;
    use crate::conductor::types::ValidationFinding;
    use crate::config::ValidatorConfig;
    use crate::reasoner::scripted::ScriptedReasoner;
    use serde_json::json;

    fn coordinator(reasoner: Arc<ScriptedReasoner>) -> Coordinator {
        let policy = Arc::new(DefaultPlaceholderPolicy::new(&ValidatorConfig::default()).unwrap());
        Coordinator::new(reasoner, policy, GenerationOptions::default())
    }

    fn facilities_plan() -> Plan {
        Plan::new(
            "g",
            vec![
                Step::new("step-1", 1, "list_facilities"),
                Step::new("step-2", 2, "get_facility")
                    .with_param("facilityId", json!("EXTRACT_FROM_STEP_1"))
                    .depends_on("step-1"),
            ],
        )
    }

    #[test]
    fn test_extract_value_shapes() {
        let list = json!([{"id": "f-1", "name": "North"}]);
        assert_eq!(extract_value(&list, None, "facilityId"), Some(json!("f-1")));
        assert_eq!(extract_value(&list, None, "name"), Some(json!("North")));
        assert_eq!(extract_value(&list, Some("0.name"), "x"), Some(json!("North")));

        let wrapped = json!({"total": 1, "facilities": [{"id": "f-9"}]});
        assert_eq!(extract_value(&wrapped, None, "facilityId"), Some(json!("f-9")));

        assert_eq!(extract_value(&json!("f-3"), None, "facilityId"), Some(json!("f-3")));
        assert_eq!(extract_value(&json!([]), None, "facilityId"), None);
        assert_eq!(extract_value(&json!([{"name": "x"}]), None, "title"), None);
    }

    #[tokio::test]
    async fn test_back_reference_resolved_without_reasoner() {
        let reasoner = Arc::new(ScriptedReasoner::new());
        let coordinator = coordinator(Arc::clone(&reasoner));
        let plan = facilities_plan();
        let mut results = BTreeMap::new();
        results.insert("step-1".to_string(), json!([{"id": "f-1"}, {"id": "f-2"}]));

        let outcome = coordinator
            .coordinate(&plan.steps[1], &plan, &results, &Critique::neutral(&plan.id, 1))
            .await
            .unwrap();

        assert_eq!(outcome.parameters["facilityId"], json!("f-1"));
        let update = outcome.update.unwrap();
        assert_eq!(update.before["facilityId"], json!("EXTRACT_FROM_STEP_1"));
        assert_eq!(update.after["facilityId"], json!("f-1"));
        assert!(update.reason.contains("step-1"));
        assert_eq!(reasoner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reference_to_unfinished_step_fails() {
        let coordinator = coordinator(Arc::new(ScriptedReasoner::new()));
        let plan = facilities_plan();

        let failure = coordinator
            .coordinate(&plan.steps[1], &plan, &BTreeMap::new(), &Critique::neutral(&plan.id, 1))
            .await
            .unwrap_err();
        assert_eq!(failure.parameter, "facilityId");
        assert!(failure.reason.contains("step-1"));
    }

    #[tokio::test]
    async fn test_self_reference_is_named() {
        let coordinator = coordinator(Arc::new(ScriptedReasoner::new()));
        let plan = Plan::new(
            "g",
            vec![Step::new("step-1", 1, "get_facility")
                .with_param("facilityId", json!("extracted_from_step_1"))],
        );
        let mut results = BTreeMap::new();
        results.insert("step-0".to_string(), json!([{"id": "f-1"}]));

        let failure = coordinator
            .coordinate(&plan.steps[0], &plan, &results, &Critique::neutral(&plan.id, 1))
            .await
            .unwrap_err();
        assert_eq!(failure.parameter, "facilityId");
        assert!(failure.reason.contains("its own result"));
    }

    #[tokio::test]
    async fn test_reasoner_extracts_from_unusual_shape() {
        let reasoner = Arc::new(
            ScriptedReasoner::new().respond("parameter coordinator", r#"{"found": true, "value": "f-42"}"#),
        );
        let coordinator = coordinator(reasoner);
        let plan = facilities_plan();
        let mut results = BTreeMap::new();
        results.insert("step-1".to_string(), json!({"summary": "North is f-42"}));

        let outcome = coordinator
            .coordinate(&plan.steps[1], &plan, &results, &Critique::neutral(&plan.id, 1))
            .await
            .unwrap();
        assert_eq!(outcome.parameters["facilityId"], json!("f-42"));
    }

    #[tokio::test]
    async fn test_dynamic_fix_fills_missing_identifier() {
        let coordinator = coordinator(Arc::new(ScriptedReasoner::new()));
        let plan = Plan::new(
            "g",
            vec![
                Step::new("step-1", 1, "list_owners"),
                Step::new("step-2", 2, "assign_owner").depends_on("step-1"),
            ],
        );
        let mut critique = Critique::neutral(&plan.id, 1);
        critique.findings.push(ValidationFinding {
            step_id: "step-2".to_string(),
            parameter_name: "ownerId".to_string(),
            category: FindingCategory::MustAskUser,
        });
        let mut results = BTreeMap::new();
        results.insert("step-1".to_string(), json!([{"id": "u-7", "name": "Ada"}]));

        let outcome = coordinator
            .coordinate(&plan.steps[1], &plan, &results, &critique)
            .await
            .unwrap();
        assert_eq!(outcome.parameters["ownerId"], json!("u-7"));
        assert!(outcome.update.is_some());
    }

    #[tokio::test]
    async fn test_nothing_to_do_means_no_update() {
        let coordinator = coordinator(Arc::new(ScriptedReasoner::new()));
        let plan = Plan::new(
            "g",
            vec![Step::new("step-1", 1, "get_facility").with_param("facilityId", json!("f-1"))],
        );
        let outcome = coordinator
            .coordinate(&plan.steps[0], &plan, &BTreeMap::new(), &Critique::neutral(&plan.id, 1))
            .await
            .unwrap();
        assert!(outcome.update.is_none());
    }
}
