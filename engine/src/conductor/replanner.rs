//! Replanner
//!
//! Produces the next version of a plan from everything learned about the
//! current one: critique issues, validation findings, assessor directives,
//! execution errors and the user's answers. Steps in the new version only use
//! catalog actions. When the reasoner gives nothing usable, implicated steps
//! are removed deterministically instead.

use crate::conductor::context::ContextAssembler;
use crate::conductor::planner::{sanitize_steps, RawStep};
use crate::conductor::scheduler::answer_value;
use crate::conductor::types::{
    Critique, DirectiveAction, FollowUpQuestion, MetaAssessment, Plan, PlanExecutionResult,
    ReplanDiff, Step, StepId, StepStatus,
};
use crate::conductor::Stage;
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use async_trait::async_trait;
use chrono::Utc;
use sdk::{errors::EngineError, ToolCatalog, ToolRunner};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const REPLANNER_INSTRUCTIONS: &str = "You are the replanner. Rewrite the plan below so it \
reaches the goal. Keep steps that worked, fix or remove the steps the critique, assessment \
and execution implicate, and use the user's answers as parameter values.\n\
Only use actions from the catalog. Refer to earlier results as {{step-N.path}}.\n\
Respond with ONLY a JSON object:\n\
{\"reasoning\": \"...\", \"confidence\": 0-1,\n \
\"steps\": [{\"id\": \"step-1\", \"description\": \"...\", \"action\": \"<tool name>\", \
\"parameters\": {}, \"dependencies\": [], \"expectedOutcome\": \"...\"}]}";

pub struct ReplanInput {
    pub plan: Plan,
    pub critique: Critique,
    pub assessment: Option<MetaAssessment>,
    pub execution: Option<PlanExecutionResult>,
    /// Tool names suggested upstream, e.g. by the planner
    pub recommended_tools: Vec<String>,
    pub insights: Vec<String>,
}

impl ReplanInput {
    pub fn new(plan: Plan, critique: Critique) -> Self {
        Self {
            plan,
            critique,
            assessment: None,
            execution: None,
            recommended_tools: Vec::new(),
            insights: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplanOutput {
    pub plan: Plan,
    pub diff: ReplanDiff,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawReplan {
    reasoning: String,
    confidence: Option<f64>,
    steps: Vec<RawStep>,
}

/// Added, removed and modified step ids between two plan versions, sorted
pub fn compute_diff(old: &Plan, new: &Plan) -> ReplanDiff {
    let old_ids = old.step_ids();
    let new_ids = new.step_ids();

    let modified = old_ids
        .intersection(&new_ids)
        .filter(|id| match (old.step(id), new.step(id)) {
            (Some(before), Some(after)) => !before.content_eq(after),
            _ => false,
        })
        .cloned()
        .collect();

    ReplanDiff {
        original_plan_id: new
            .original_plan_id
            .clone()
            .unwrap_or_else(|| old.root_id().to_string()),
        new_plan_id: new.id.clone(),
        from_version: old.version,
        to_version: new.version,
        added_steps: new_ids.difference(&old_ids).cloned().collect(),
        removed_steps: old_ids.difference(&new_ids).cloned().collect(),
        modified_steps: modified,
    }
}

/// Answered questions from the critique and the execution, first answer per id
fn answered_questions(input: &ReplanInput) -> Vec<FollowUpQuestion> {
    let mut seen = BTreeSet::new();
    input
        .execution
        .iter()
        .flat_map(|e| e.questions_asked.iter())
        .chain(input.critique.follow_up_questions.iter())
        .filter(|q| q.is_answered())
        .filter(|q| seen.insert(q.id.clone()))
        .cloned()
        .collect()
}

fn apply_answers(steps: &mut [Step], answers: &[FollowUpQuestion]) {
    for question in answers {
        let (Some(step_id), Some(parameter), Some(answer)) =
            (&question.step_id, &question.parameter, &question.answer)
        else {
            continue;
        };
        if let Some(step) = steps.iter_mut().find(|s| &s.id == step_id) {
            step.parameters.insert(parameter.clone(), answer_value(answer));
        }
    }
}

/// Steps that the critique, assessment, execution or the user's answers point at
fn implicated_steps(input: &ReplanInput) -> BTreeSet<StepId> {
    let critique = &input.critique;
    let mut ids: BTreeSet<StepId> = critique
        .issues
        .iter()
        .flat_map(|i| i.affected_steps.iter().cloned())
        .chain(critique.findings.iter().map(|f| f.step_id.clone()))
        .chain(critique.follow_up_questions.iter().filter_map(|q| q.step_id.clone()))
        .collect();

    for directive in input.assessment.iter().flat_map(|a| a.orchestrator_directives.iter()) {
        ids.extend(
            input
                .plan
                .steps
                .iter()
                .filter(|s| s.id == directive.target || s.action == directive.target)
                .map(|s| s.id.clone()),
        );
    }
    if let Some(execution) = &input.execution {
        ids.extend(execution.errors.iter().filter_map(|e| e.step_id.clone()));
        ids.extend(execution.questions_asked.iter().filter_map(|q| q.step_id.clone()));
    }
    ids.extend(
        input
            .plan
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
            .map(|s| s.id.clone()),
    );
    ids
}

/// `dependencies` with each step outside `kept` replaced by what that step
/// depended on, transitively
fn inherit_dependencies(
    dependencies: &BTreeSet<StepId>,
    kept: &BTreeSet<StepId>,
    old: &Plan,
) -> BTreeSet<StepId> {
    let mut inherited = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut queue: Vec<&StepId> = dependencies.iter().collect();
    while let Some(dependency) = queue.pop() {
        if !seen.insert(dependency) {
            continue;
        }
        if kept.contains(dependency) {
            inherited.insert(dependency.clone());
        } else if let Some(removed) = old.step(dependency) {
            queue.extend(removed.dependencies.iter());
        }
    }
    inherited
}

/// Steps the reasoner kept that nothing implicated go back to their previous
/// content. Only their position in the plan may change.
fn preserve_untouched(steps: &mut [Step], old: &Plan, implicated: &BTreeSet<StepId>) {
    let kept: BTreeSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
    for step in steps.iter_mut().filter(|s| !implicated.contains(&s.id)) {
        let Some(before) = old.step(&step.id) else {
            continue;
        };
        let order = step.order;
        *step = before.clone();
        step.order = order;
        step.status = StepStatus::Pending;
        step.dependencies = inherit_dependencies(&before.dependencies, &kept, old);
    }
}

/// Wrap `steps` as the version after `old`
fn next_version(old: &Plan, steps: Vec<Step>, confidence: f64) -> Plan {
    let mut plan = Plan::new(old.goal.clone(), steps);
    plan.confidence = confidence.clamp(0.0, 1.0);
    plan.estimated_complexity = old.estimated_complexity;
    plan.version = old.version + 1;
    plan.created_at = Utc::now();
    plan.original_plan_id = Some(old.root_id().to_string());
    plan
}

/// Deterministic rewrite: drop critical and directive-removed steps, apply
/// tool replacements and answers, and prune dependencies on removed steps.
pub fn fallback_replan(input: &ReplanInput, catalog: Option<&ToolCatalog>) -> Plan {
    let mut remove = input.critique.critical_steps();
    let directives = input
        .assessment
        .iter()
        .flat_map(|a| a.orchestrator_directives.iter());
    let mut replacements = Vec::new();
    for directive in directives {
        match directive.action {
            DirectiveAction::RemoveStep => {
                remove.insert(directive.target.clone());
            }
            DirectiveAction::ReplaceTool => {
                let replacement = match catalog {
                    Some(catalog) => catalog.normalize_action(directive.detail.trim()),
                    None => Some(directive.detail.trim().to_string()).filter(|d| !d.is_empty()),
                };
                if let Some(replacement) = replacement {
                    replacements.push((directive.target.clone(), replacement));
                }
            }
            _ => {}
        }
    }

    let mut steps: Vec<Step> = input
        .plan
        .steps
        .iter()
        .filter(|s| !remove.contains(&s.id))
        .cloned()
        .collect();
    for step in &mut steps {
        if let Some((_, replacement)) = replacements
            .iter()
            .find(|(target, _)| target == &step.id || target == &step.action)
        {
            step.action = replacement.clone();
        }
    }
    if let Some(catalog) = catalog {
        steps.retain(|s| {
            let known = catalog.has_action(&s.action);
            if !known {
                warn!(step_id = %s.id, action = %s.action, "Dropping step with unknown action");
            }
            known
        });
    }

    let kept: BTreeSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
    for step in &mut steps {
        step.dependencies = inherit_dependencies(&step.dependencies, &kept, &input.plan);
        step.status = StepStatus::Pending;
    }
    apply_answers(&mut steps, &answered_questions(input));

    next_version(&input.plan, steps, input.plan.confidence.min(input.critique.overall_score))
}

pub struct Replanner {
    reasoner: Arc<dyn Reasoner>,
    runner: Arc<dyn ToolRunner>,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl Replanner {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        runner: Arc<dyn ToolRunner>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            reasoner,
            runner,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    async fn propose(
        &self,
        input: &ReplanInput,
        catalog: &ToolCatalog,
        answers: &[FollowUpQuestion],
    ) -> Result<RawReplan, EngineError> {
        let mut sections = vec![
            ("Goal", input.plan.goal.clone()),
            ("Current plan", serde_json::to_string_pretty(&input.plan)?),
            ("Critique issues", serde_json::to_string_pretty(&input.critique.issues)?),
            (
                "Validation findings",
                serde_json::to_string_pretty(&input.critique.findings)?,
            ),
            ("Answered questions", serde_json::to_string_pretty(answers)?),
            ("Catalog", catalog.action_names().join(", ")),
        ];
        if let Some(assessment) = &input.assessment {
            sections.push((
                "Assessment",
                format!(
                    "strategy: {}\nfocus: {}\ndirectives:\n{}",
                    assessment.replan_strategy,
                    assessment.focus_areas.join(", "),
                    serde_json::to_string_pretty(&assessment.orchestrator_directives)?
                ),
            ));
        }
        if let Some(execution) = &input.execution {
            sections.push((
                "Execution",
                format!(
                    "completed: {}\nerrors: {}",
                    execution.partial_results.keys().cloned().collect::<Vec<_>>().join(", "),
                    serde_json::to_string_pretty(&execution.errors)?
                ),
            ));
        }
        if !input.recommended_tools.is_empty() {
            sections.push(("Recommended tools", input.recommended_tools.join(", ")));
        }
        if !input.insights.is_empty() {
            sections.push(("Insights", input.insights.join("\n")));
        }

        let messages = self
            .assembler
            .assemble(REPLANNER_INSTRUCTIONS, &sections, "Produce the revised plan.");
        Ok(generate_structured(self.reasoner.as_ref(), &messages, &self.options).await?)
    }
}

#[async_trait]
impl Stage for Replanner {
    type Input = ReplanInput;
    type Output = ReplanOutput;

    fn name(&self) -> &'static str {
        "replanner"
    }

    async fn run(&self, input: &mut ReplanInput) -> Result<ReplanOutput, EngineError> {
        let catalog = self.runner.catalog().await?;
        let answers = answered_questions(input);

        let proposed = match self.propose(input, &catalog, &answers).await {
            Ok(raw) => {
                let (mut steps, dropped) = sanitize_steps(raw.steps, &catalog);
                if !dropped.is_empty() {
                    warn!(dropped = ?dropped, "Replan used actions outside the catalog");
                }
                if steps.is_empty() {
                    None
                } else {
                    preserve_untouched(&mut steps, &input.plan, &implicated_steps(input));
                    apply_answers(&mut steps, &answers);
                    let confidence = raw.confidence.unwrap_or(input.plan.confidence);
                    info!(reasoning = %raw.reasoning, "Replan proposed");
                    Some(next_version(&input.plan, steps, confidence))
                }
            }
            Err(e) => {
                warn!(plan_id = %input.plan.id, error = %e, "Replan request failed");
                None
            }
        };

        let plan = match proposed {
            Some(plan) => plan,
            None => {
                warn!(plan_id = %input.plan.id, "Using deterministic replan");
                fallback_replan(input, Some(&catalog))
            }
        };
        let diff = compute_diff(&input.plan, &plan);
        info!(
            plan_id = %plan.id,
            version = plan.version,
            added = diff.added_steps.len(),
            removed = diff.removed_steps.len(),
            modified = diff.modified_steps.len(),
            "Plan revised"
        );
        Ok(ReplanOutput { plan, diff })
    }

    async fn handle_error(
        &self,
        input: &ReplanInput,
        error: EngineError,
    ) -> Result<ReplanOutput, EngineError> {
        warn!(plan_id = %input.plan.id, error = %error, "Replanning without the catalog");
        let plan = fallback_replan(input, None);
        let diff = compute_diff(&input.plan, &plan);
        Ok(ReplanOutput { plan, diff })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::{Directive, Issue, IssueCategory, QuestionPriority, Severity};
    use crate::reasoner::scripted::ScriptedReasoner;
    use crate::tools::InMemoryToolRunner;
    use sdk::{ParamSpec, ToolSpec};
    use serde_json::json;

    fn runner() -> Arc<dyn ToolRunner> {
        Arc::new(
            InMemoryToolRunner::new()
                .with_tool(ToolSpec::new("list_facilities", "List"), |_| Ok(json!([])))
                .with_tool(ToolSpec::new("search_facilities", "Search"), |_| Ok(json!([])))
                .with_tool(
                    ToolSpec::new("get_facility", "Get")
                        .with_required("facilityId", ParamSpec::of_type("string")),
                    |_| Ok(json!({})),
                ),
        )
    }

    fn plan() -> Plan {
        Plan::new(
            "inspect the north facility",
            vec![
                Step::new("step-1", 1, "list_facilities"),
                Step::new("step-2", 2, "get_facility")
                    .with_param("facilityId", json!("TBD"))
                    .depends_on("step-1"),
                Step::new("step-3", 3, "teleport").depends_on("step-2"),
            ],
        )
    }

    fn critique(plan: &Plan) -> Critique {
        let mut critique = Critique::neutral(&plan.id, 1);
        critique.issues.push(Issue {
            severity: Severity::Critical,
            category: IssueCategory::UnknownTool,
            description: "teleport is not a known tool".to_string(),
            affected_steps: vec!["step-3".to_string()],
        });
        critique.follow_up_questions.push(FollowUpQuestion {
            id: "q-1".to_string(),
            question: "Which facility?".to_string(),
            priority: QuestionPriority::High,
            step_id: Some("step-2".to_string()),
            parameter: Some("facilityId".to_string()),
            answer: Some("f-9".to_string()),
        });
        critique
    }

    #[test]
    fn test_compute_diff() {
        let old = plan();
        let mut new = old.clone();
        new.id = "next".to_string();
        new.version = 2;
        new.original_plan_id = Some(old.id.clone());
        new.steps.retain(|s| s.id != "step-3");
        new.steps[1].parameters.insert("facilityId".to_string(), json!("f-9"));
        new.steps[0].status = StepStatus::Succeeded;
        new.steps.push(Step::new("step-4", 4, "search_facilities"));

        let diff = compute_diff(&old, &new);
        assert_eq!(diff.added_steps, vec!["step-4"]);
        assert_eq!(diff.removed_steps, vec!["step-3"]);
        assert_eq!(diff.modified_steps, vec!["step-2"]);
        assert_eq!(diff.original_plan_id, old.id);
        assert_eq!((diff.from_version, diff.to_version), (1, 2));
    }

    #[tokio::test]
    async fn test_reasoner_replan_is_sanitized() {
        let reply = r#"{"reasoning": "search instead", "confidence": 0.7, "steps": [
            {"id": "step-1", "action": "tools.search_facilities", "parameters": {"query": "north"}},
            {"id": "step-2", "action": "get_facility", "dependencies": ["step-1"],
             "parameters": {"facilityId": "TBD"}},
            {"id": "step-3", "action": "teleport"}]}"#;
        let replanner = Replanner::new(
            Arc::new(ScriptedReasoner::new().respond("You are the replanner", reply)),
            runner(),
            GenerationOptions::default(),
        );
        let old = plan();
        let mut critique = critique(&old);
        critique.issues.push(Issue {
            severity: Severity::Medium,
            category: IssueCategory::Efficiency,
            description: "listing every facility is slow".to_string(),
            affected_steps: vec!["step-1".to_string()],
        });
        let mut input = ReplanInput::new(old.clone(), critique);

        let output = replanner.execute(&mut input).await.unwrap();
        let new = &output.plan;
        assert_eq!(new.version, 2);
        assert_eq!(new.original_plan_id.as_deref(), Some(old.id.as_str()));
        assert_ne!(new.id, old.id);
        assert_eq!(new.steps.len(), 2);
        assert_eq!(new.steps[0].action, "search_facilities");
        assert_eq!(new.steps[1].parameters["facilityId"], json!("f-9"));
        assert_eq!(output.diff.removed_steps, vec!["step-3"]);
        assert_eq!(output.diff.modified_steps, vec!["step-1", "step-2"]);
    }

    #[tokio::test]
    async fn test_reasoner_cannot_rewrite_untouched_steps() {
        let reply = r#"{"reasoning": "use a known facility", "steps": [
            {"id": "step-1", "action": "list_facilities"},
            {"id": "step-2", "action": "get_facility", "dependencies": ["step-1"],
             "parameters": {"facilityId": "f-1"}},
            {"id": "step-3", "action": "search_facilities", "dependencies": ["step-1"],
             "parameters": {"query": "everything"}}]}"#;
        let replanner = Replanner::new(
            Arc::new(ScriptedReasoner::new().respond("You are the replanner", reply)),
            runner(),
            GenerationOptions::default(),
        );
        let old = Plan::new(
            "inspect",
            vec![
                Step::new("step-1", 1, "list_facilities")
                    .describe("List all facilities")
                    .expecting("Facility records"),
                Step::new("step-2", 2, "get_facility")
                    .with_param("facilityId", json!("f-404"))
                    .depends_on("step-1"),
                Step::new("step-3", 3, "search_facilities")
                    .describe("Search by region")
                    .with_param("query", json!("north"))
                    .depends_on("step-1"),
            ],
        );
        let mut critique = Critique::neutral(&old.id, 1);
        critique.issues.push(Issue {
            severity: Severity::Critical,
            category: IssueCategory::Correctness,
            description: "facility f-404 does not exist".to_string(),
            affected_steps: vec!["step-2".to_string()],
        });
        let mut input = ReplanInput::new(old.clone(), critique);

        let output = replanner.execute(&mut input).await.unwrap();

        assert_eq!(output.diff.modified_steps, vec!["step-2"]);
        assert!(output.diff.added_steps.is_empty());
        assert!(output.diff.removed_steps.is_empty());
        let kept = output.plan.step("step-3").unwrap();
        assert!(kept.content_eq(old.step("step-3").unwrap()));
        assert_eq!(kept.parameters["query"], json!("north"));
        assert_eq!(output.plan.step("step-1").unwrap().description, "List all facilities");
    }

    #[test]
    fn test_fallback_rewires_dependants_of_removed_steps() {
        let old = plan();
        let mut critique = Critique::neutral(&old.id, 1);
        critique.issues.push(Issue {
            severity: Severity::Critical,
            category: IssueCategory::Correctness,
            description: "wrong facility".to_string(),
            affected_steps: vec!["step-2".to_string()],
        });
        let input = ReplanInput::new(old.clone(), critique);

        let new = fallback_replan(&input, None);
        let step_3 = new.step("step-3").unwrap();
        assert_eq!(
            step_3.dependencies.iter().collect::<Vec<_>>(),
            vec!["step-1"]
        );
        let diff = compute_diff(&old, &new);
        assert_eq!(diff.removed_steps, vec!["step-2"]);
        assert!(!diff.modified_steps.contains(&"step-1".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_removes_implicated_steps() {
        let replanner = Replanner::new(
            Arc::new(ScriptedReasoner::new().fail_on("You are the replanner", "offline")),
            runner(),
            GenerationOptions::default(),
        );
        let old = plan();
        let mut input = ReplanInput::new(old.clone(), critique(&old));
        let mut assessment = crate::conductor::assessor::conservative_assessment(Default::default());
        assessment.orchestrator_directives.push(Directive {
            action: DirectiveAction::ReplaceTool,
            target: "step-1".to_string(),
            detail: "search_facilities".to_string(),
        });
        input.assessment = Some(assessment);

        let output = replanner.execute(&mut input).await.unwrap();
        let ids: Vec<&str> = output.plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step-1", "step-2"]);
        assert_eq!(output.plan.steps[0].action, "search_facilities");
        assert_eq!(output.plan.steps[1].parameters["facilityId"], json!("f-9"));
        assert_eq!(output.plan.version, 2);
        assert_eq!(output.diff.removed_steps, vec!["step-3"]);
    }

    #[test]
    fn test_chained_replans_keep_the_root_id() {
        let first = plan();
        let input = ReplanInput::new(first.clone(), Critique::neutral(&first.id, 1));
        let second = fallback_replan(&input, None);
        let input = ReplanInput::new(second.clone(), Critique::neutral(&second.id, 2));
        let third = fallback_replan(&input, None);

        assert_eq!(third.version, 3);
        assert_eq!(third.original_plan_id.as_deref(), Some(first.id.as_str()));
    }
}
