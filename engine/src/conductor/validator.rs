//! Parameter Validator/Resolver
//!
//! Finds the required parameters each step is missing, then tries to fill them
//! without a human: call a lookup tool the runner suggests and pull the value
//! out of its result, or apply a value the runner says is safe to infer. The
//! loop re-validates after every pass and stops when nothing is missing,
//! nothing new was produced, or the iteration bound is hit.

use crate::conductor::placeholder::PlaceholderPolicy;
use crate::conductor::types::{FindingCategory, Plan, Step, StepId, ValidationFinding};
use crate::config::ValidatorConfig;
use crate::tools::extract_path;
use sdk::{
    errors::EngineError, validation::is_blank, Arguments, ParamCategorization, ToolCatalog,
    ToolRunner,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a filled-in value came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ValueSource {
    Resolved { tool: String, path: String },
    Inferred { reason: String },
}

/// A parameter value written into the plan by the resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledParameter {
    pub step_id: StepId,
    pub parameter: String,
    pub value: Value,
    pub source: ValueSource,
}

/// A back-reference left in place for the scheduler to resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredReference {
    pub step_id: StepId,
    pub parameter: String,
    pub source_step: StepId,
}

/// Outcome of a validate/resolve run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Findings still open after the last pass
    pub findings: Vec<ValidationFinding>,
    pub iterations: usize,
    /// Missing-parameter count seen at the start of each pass
    pub missing_history: Vec<usize>,
    pub filled: Vec<FilledParameter>,
    pub deferred: Vec<DeferredReference>,
    /// Steps whose action is neither a tool nor a workflow template
    pub unknown_actions: Vec<StepId>,
    /// `(step, from, to)` for actions rewritten to their catalog name
    pub normalized_actions: Vec<(StepId, String, String)>,
}

impl ValidationReport {
    pub fn must_ask_user(&self) -> impl Iterator<Item = &ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.category == FindingCategory::MustAskUser)
    }
}

/// Findings and the runner's remediation hints for one step
struct StepScan {
    step_id: StepId,
    categorization: ParamCategorization,
}

struct Scan {
    findings: Vec<ValidationFinding>,
    steps: Vec<StepScan>,
    deferred: Vec<DeferredReference>,
}

pub struct ParameterValidator {
    runner: Arc<dyn ToolRunner>,
    policy: Arc<dyn PlaceholderPolicy>,
    config: ValidatorConfig,
}

impl ParameterValidator {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        policy: Arc<dyn PlaceholderPolicy>,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            runner,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &Arc<dyn PlaceholderPolicy> {
        &self.policy
    }

    /// Validate every step of `plan` and fill what can be filled, in place.
    pub async fn validate_and_resolve(
        &self,
        plan: &mut Plan,
        context: &Arguments,
    ) -> Result<ValidationReport, EngineError> {
        let catalog = self.runner.catalog().await?;
        let mut report = ValidationReport::default();

        for step in &mut plan.steps {
            match catalog.normalize_action(&step.action) {
                Some(name) if name != step.action => {
                    debug!(step_id = %step.id, from = %step.action, to = %name, "Normalized action");
                    report
                        .normalized_actions
                        .push((step.id.clone(), step.action.clone(), name.clone()));
                    step.action = name;
                }
                Some(_) => {}
                None => report.unknown_actions.push(step.id.clone()),
            }
        }

        let mut lookups: HashMap<String, Value> = HashMap::new();
        let mut applied: HashSet<(StepId, String, String)> = HashSet::new();

        loop {
            report.iterations += 1;
            let scan = self.scan(plan, &catalog, context, None).await?;
            report.missing_history.push(scan.findings.len());
            report.findings = scan.findings;
            report.deferred = scan.deferred;

            if report.findings.is_empty() || report.iterations >= self.config.max_iterations {
                break;
            }

            let produced = self
                .resolve_pass(plan, &scan.steps, &mut lookups, &mut applied, &mut report.filled)
                .await;
            if produced == 0 {
                break;
            }
        }

        info!(
            plan_id = %plan.id,
            iterations = report.iterations,
            open_findings = report.findings.len(),
            filled = report.filled.len(),
            "Parameter validation finished"
        );
        Ok(report)
    }

    /// Re-validate only `step_ids`, without resolving anything
    pub async fn validate_steps(
        &self,
        plan: &Plan,
        step_ids: &[StepId],
        context: &Arguments,
    ) -> Result<Vec<ValidationFinding>, EngineError> {
        let catalog = self.runner.catalog().await?;
        let only: BTreeSet<&str> = step_ids.iter().map(String::as_str).collect();
        Ok(self.scan(plan, &catalog, context, Some(&only)).await?.findings)
    }

    async fn scan(
        &self,
        plan: &Plan,
        catalog: &ToolCatalog,
        context: &Arguments,
        only: Option<&BTreeSet<&str>>,
    ) -> Result<Scan, EngineError> {
        let mut scan = Scan {
            findings: Vec::new(),
            steps: Vec::new(),
            deferred: Vec::new(),
        };

        for step in &plan.steps {
            if only.is_some_and(|ids| !ids.contains(step.id.as_str())) {
                continue;
            }
            let Some(required) = required_params(catalog, &step.action) else {
                continue;
            };

            let (arguments, dangling) =
                self.effective_arguments(plan, step, required, &mut scan.deferred);
            let validation = match self
                .runner
                .validate_params(&step.action, &arguments, context)
                .await
            {
                Ok(v) => v,
                Err(EngineError::ToolNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            let mut categorization = validation.categorization;
            if !dangling.is_empty() {
                categorization.resolvable.retain(|r| !dangling.contains(&r.param));
                categorization.can_infer.retain(|c| !dangling.contains(&c.param));
                for param in &dangling {
                    if !categorization.must_ask_user.contains(param) {
                        categorization.must_ask_user.push(param.clone());
                    }
                }
            }

            let finding = |param: &str, category| ValidationFinding {
                step_id: step.id.clone(),
                parameter_name: param.to_string(),
                category,
            };
            scan.findings.extend(
                categorization
                    .resolvable
                    .iter()
                    .map(|r| finding(&r.param, FindingCategory::Resolvable)),
            );
            scan.findings.extend(
                categorization
                    .can_infer
                    .iter()
                    .map(|c| finding(&c.param, FindingCategory::CanInfer)),
            );
            scan.findings.extend(
                categorization
                    .must_ask_user
                    .iter()
                    .map(|p| finding(p, FindingCategory::MustAskUser)),
            );

            if !categorization.is_empty() {
                scan.steps.push(StepScan {
                    step_id: step.id.clone(),
                    categorization,
                });
            }
        }

        Ok(scan)
    }

    /// Arguments as the runner should see them: placeholders removed,
    /// back-references to earlier steps kept. Returns the dangling
    /// back-references separately.
    fn effective_arguments(
        &self,
        plan: &Plan,
        step: &Step,
        required: &[String],
        deferred: &mut Vec<DeferredReference>,
    ) -> (Arguments, Vec<String>) {
        let mut arguments = step.parameters.clone();
        let mut dangling = Vec::new();

        for param in required {
            let Some(value) = step.parameters.get(param) else {
                continue;
            };
            if let Some(reference) = self.policy.back_reference(value) {
                match reference.resolve(plan).filter(|source| source.order < step.order) {
                    Some(source) => deferred.push(DeferredReference {
                        step_id: step.id.clone(),
                        parameter: param.clone(),
                        source_step: source.id.clone(),
                    }),
                    None => {
                        arguments.remove(param);
                        dangling.push(param.clone());
                    }
                }
            } else if self.policy.is_placeholder(param, value) {
                arguments.remove(param);
            }
        }

        (arguments, dangling)
    }

    /// Apply every resolvable and inferable value once. Returns how many new
    /// values were written.
    async fn resolve_pass(
        &self,
        plan: &mut Plan,
        steps: &[StepScan],
        lookups: &mut HashMap<String, Value>,
        applied: &mut HashSet<(StepId, String, String)>,
        filled: &mut Vec<FilledParameter>,
    ) -> usize {
        let mut produced = 0;

        for scan in steps {
            let mut writes: Vec<(String, Value, ValueSource)> = Vec::new();

            for resolvable in &scan.categorization.resolvable {
                let key = format!(
                    "{}:{}",
                    resolvable.suggested_tool,
                    serde_json::to_string(&resolvable.suggested_arguments).unwrap_or_default()
                );
                let result = match lookups.get(&key) {
                    Some(cached) => cached.clone(),
                    None => match self
                        .runner
                        .call_tool(&resolvable.suggested_tool, &resolvable.suggested_arguments)
                        .await
                    {
                        Ok(value) => {
                            lookups.insert(key, value.clone());
                            value
                        }
                        Err(e) => {
                            warn!(
                                step_id = %scan.step_id,
                                tool = %resolvable.suggested_tool,
                                error = %e,
                                "Lookup for missing parameter failed"
                            );
                            continue;
                        }
                    },
                };

                let Some(value) = extract_path(&result, &resolvable.extraction_path) else {
                    debug!(
                        step_id = %scan.step_id,
                        path = %resolvable.extraction_path,
                        "Lookup result has nothing at extraction path"
                    );
                    continue;
                };
                if is_blank(value) || self.policy.is_placeholder(&resolvable.param, value) {
                    continue;
                }
                writes.push((
                    resolvable.param.clone(),
                    value.clone(),
                    ValueSource::Resolved {
                        tool: resolvable.suggested_tool.clone(),
                        path: resolvable.extraction_path.clone(),
                    },
                ));
            }

            for inferable in &scan.categorization.can_infer {
                writes.push((
                    inferable.param.clone(),
                    inferable.value.clone(),
                    ValueSource::Inferred {
                        reason: inferable.reason.clone(),
                    },
                ));
            }

            let Some(step) = plan.step_mut(&scan.step_id) else {
                continue;
            };
            for (param, value, source) in writes {
                let marker = (step.id.clone(), param.clone(), value.to_string());
                if !applied.insert(marker) {
                    continue;
                }
                debug!(step_id = %step.id, param = %param, "Filled missing parameter");
                step.parameters.insert(param.clone(), value.clone());
                filled.push(FilledParameter {
                    step_id: step.id.clone(),
                    parameter: param,
                    value,
                    source,
                });
                produced += 1;
            }
        }

        produced
    }
}

fn required_params<'a>(catalog: &'a ToolCatalog, action: &str) -> Option<&'a [String]> {
    catalog
        .get_tool(action)
        .map(|t| t.input_schema.required.as_slice())
        .or_else(|| catalog.get_workflow(action).map(|w| w.input_schema.required.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::placeholder::DefaultPlaceholderPolicy;
    use crate::tools::InMemoryToolRunner;
    use sdk::{ParamSpec, ToolSpec};
    use serde_json::json;

    fn validator(runner: InMemoryToolRunner) -> (ParameterValidator, Arc<InMemoryToolRunner>) {
        let runner = Arc::new(runner);
        let config = ValidatorConfig::default();
        let policy = Arc::new(DefaultPlaceholderPolicy::new(&config).unwrap());
        (
            ParameterValidator::new(Arc::clone(&runner) as Arc<dyn ToolRunner>, policy, config),
            runner,
        )
    }

    fn facilities_runner() -> InMemoryToolRunner {
        InMemoryToolRunner::new()
            .with_tool(ToolSpec::new("list_facilities", "List facilities"), |_| {
                Ok(json!([{"id": "f-1", "name": "North"}, {"id": "f-2", "name": "South"}]))
            })
            .with_tool(
                ToolSpec::new("get_facility", "Get one facility")
                    .with_required("facilityId", ParamSpec::of_type("string")),
                |args| Ok(json!({"id": args.get("facilityId")})),
            )
            .with_tool(
                ToolSpec::new("assign_owner", "Assign an owner")
                    .with_required("ownerId", ParamSpec::of_type("string")),
                |_| Ok(json!({"ok": true})),
            )
    }

    #[tokio::test]
    async fn test_resolvable_identifier_is_filled_from_lookup() {
        let (validator, runner) = validator(facilities_runner());
        let mut plan = Plan::new(
            "inspect a facility",
            vec![Step::new("step-1", 1, "get_facility").with_param("facilityId", json!("TBD"))],
        );

        let report = validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        assert!(report.findings.is_empty());
        assert_eq!(plan.steps[0].parameters["facilityId"], json!("f-1"));
        assert_eq!(report.iterations, 2);
        assert_eq!(report.missing_history, vec![1, 0]);
        assert_eq!(runner.call_count("list_facilities"), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_parameter_must_ask_user() {
        let (validator, _) = validator(facilities_runner());
        let mut plan = Plan::new("g", vec![Step::new("step-1", 1, "assign_owner")]);

        let report = validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        assert_eq!(report.must_ask_user().count(), 1);
        assert_eq!(report.iterations, 1);
        assert!(plan.steps[0].parameters.is_empty());
    }

    #[tokio::test]
    async fn test_back_reference_to_earlier_step_is_deferred() {
        let (validator, runner) = validator(facilities_runner());
        let mut plan = Plan::new(
            "g",
            vec![
                Step::new("step-1", 1, "list_facilities"),
                Step::new("step-2", 2, "get_facility")
                    .with_param("facilityId", json!("EXTRACT_FROM_STEP_1"))
                    .depends_on("step-1"),
            ],
        );

        let report = validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        assert!(report.findings.is_empty());
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].source_step, "step-1");
        assert_eq!(plan.steps[1].parameters["facilityId"], json!("EXTRACT_FROM_STEP_1"));
        assert_eq!(runner.call_count("list_facilities"), 0);
    }

    #[tokio::test]
    async fn test_dangling_back_reference_must_ask_user() {
        let (validator, _) = validator(facilities_runner());
        let mut plan = Plan::new(
            "g",
            vec![Step::new("step-1", 1, "get_facility")
                .with_param("facilityId", json!("extracted_from_step_1"))],
        );

        let report = validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        let findings: Vec<_> = report.must_ask_user().collect();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].parameter_name, "facilityId");
    }

    #[tokio::test]
    async fn test_unknown_and_namespaced_actions() {
        let (validator, _) = validator(facilities_runner());
        let mut plan = Plan::new(
            "g",
            vec![
                Step::new("step-1", 1, "facilities.list_facilities"),
                Step::new("step-2", 2, "launch_rocket"),
            ],
        );

        let report = validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        assert_eq!(plan.steps[0].action, "list_facilities");
        assert_eq!(report.unknown_actions, vec!["step-2"]);
    }

    #[tokio::test]
    async fn test_revalidating_a_resolved_plan_is_clean() {
        let (validator, _) = validator(facilities_runner());
        let mut plan = Plan::new(
            "g",
            vec![Step::new("step-1", 1, "get_facility").with_param("facilityId", json!(""))],
        );
        validator
            .validate_and_resolve(&mut plan, &Arguments::new())
            .await
            .unwrap();

        let again = validator
            .validate_steps(&plan, &["step-1".to_string()], &Arguments::new())
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
