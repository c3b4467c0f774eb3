//! Conductor Planner
//!
//! Turns a goal into a first-version [`Plan`] over the tools the runner
//! advertises. Reasoner output that cannot be used yields a fallback plan
//! instead of an error.

use crate::conductor::context::ContextAssembler;
use crate::conductor::memory::{keywords, ExampleMemory};
use crate::conductor::types::{Plan, Step, StepId};
use crate::conductor::Stage;
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use async_trait::async_trait;
use sdk::{errors::EngineError, Arguments, ToolCatalog, ToolRunner};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const PLANNER_INSTRUCTIONS: &str = "You are the planner. Break the user's goal into steps, \
each calling exactly one tool or workflow from the catalog below.\n\
Use the exact catalog names. When a step needs a value an earlier step returns, \
write it as {{step-N.path}} (for example {{step-1.0.id}}) and list step-N as a dependency.\n\
Respond with ONLY a JSON object:\n\
{\"reasoning\": \"...\", \"confidence\": 0-1, \"estimatedComplexity\": 0-1,\n \
\"steps\": [{\"id\": \"step-1\", \"description\": \"...\", \"action\": \"<tool name>\", \
\"parameters\": {}, \"dependencies\": [], \"expectedOutcome\": \"...\"}],\n \
\"recommendedTools\": [\"...\"], \"insights\": [\"...\"]}";

/// Number of past examples shown to the reasoner
const EXAMPLE_LIMIT: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub goal: String,
    pub context: Arguments,
}

impl PlanRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            context: Arguments::new(),
        }
    }
}

/// A plan with the reasoning and hints that came with it
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub plan: Plan,
    pub reasoning: String,
    pub recommended_tools: Vec<String>,
    pub insights: Vec<String>,
}

/// Intermediate deserialization type for reasoner JSON output
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPlan {
    reasoning: String,
    confidence: Option<f64>,
    estimated_complexity: Option<f64>,
    steps: Vec<RawStep>,
    recommended_tools: Vec<String>,
    insights: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RawStep {
    pub id: Option<String>,
    pub description: String,
    #[serde(alias = "tool")]
    pub action: String,
    pub parameters: Arguments,
    pub dependencies: Vec<String>,
    pub expected_outcome: Option<String>,
}

/// Turn reasoner steps into plan steps.
///
/// Actions are normalized against the catalog and steps with unknown actions
/// are dropped. Missing or repeated ids become `step-N`, orders run 1..n in
/// listing order, and dependencies on steps that did not survive are removed.
/// Returns the steps and the actions that were dropped.
pub(crate) fn sanitize_steps(raw: Vec<RawStep>, catalog: &ToolCatalog) -> (Vec<Step>, Vec<String>) {
    let mut dropped = Vec::new();
    let mut kept: Vec<(Vec<String>, Step)> = Vec::new();
    let mut renamed: HashMap<String, StepId> = HashMap::new();
    let mut used: BTreeSet<StepId> = BTreeSet::new();

    for raw_step in raw {
        let Some(action) = catalog.normalize_action(raw_step.action.trim()) else {
            warn!(action = %raw_step.action, "Dropping step with an action outside the catalog");
            dropped.push(raw_step.action);
            continue;
        };

        let proposed = raw_step.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());
        let id = match &proposed {
            Some(id) if !used.contains(id) => id.clone(),
            _ => {
                let mut n = kept.len() + 1;
                while used.contains(&format!("step-{}", n)) {
                    n += 1;
                }
                format!("step-{}", n)
            }
        };
        if let Some(proposed) = proposed {
            renamed.entry(proposed).or_insert_with(|| id.clone());
        }
        used.insert(id.clone());

        let order = u32::try_from(kept.len() + 1).unwrap_or(u32::MAX);
        let mut step = Step::new(id, order, action.clone())
            .describe(if raw_step.description.trim().is_empty() {
                action
            } else {
                raw_step.description
            })
            .expecting(raw_step.expected_outcome.unwrap_or_else(|| "Step completed".to_string()));
        step.parameters = raw_step.parameters;
        kept.push((raw_step.dependencies, step));
    }

    let steps = kept
        .into_iter()
        .map(|(dependencies, mut step)| {
            step.dependencies = dependencies
                .iter()
                .filter_map(|d| renamed.get(d.trim()).cloned().or_else(|| used.get(d.trim()).cloned()))
                .filter(|d| d != &step.id)
                .collect();
            step
        })
        .collect();
    (steps, dropped)
}

/// Catalog action sharing the most words with `goal`
fn best_matching_action(goal: &str, catalog: &ToolCatalog) -> Option<String> {
    let wanted = keywords(goal);
    let described = catalog
        .tools
        .iter()
        .map(|t| (t.name.as_str(), t.description.as_str()))
        .chain(catalog.workflows.iter().map(|w| (w.name.as_str(), w.description.as_str())));

    described
        .map(|(name, description)| {
            let words = keywords(&format!("{} {}", name.replace(['_', '.', '-'], " "), description));
            (wanted.intersection(&words).count(), name)
        })
        .filter(|(overlap, _)| *overlap > 0)
        .fold(None, |best: Option<(usize, &str)>, candidate| match best {
            Some(b) if b.0 >= candidate.0 => Some(b),
            _ => Some(candidate),
        })
        .map(|(_, name)| name.to_string())
}

/// Plan used when the reasoner gives nothing usable: one step with the
/// closest catalog action, or no steps at all.
pub fn default_plan(goal: &str, catalog: &ToolCatalog) -> Plan {
    match best_matching_action(goal, catalog) {
        Some(action) => {
            let step = Step::new("step-1", 1, action.clone())
                .describe(format!("Run {} for: {}", action, goal))
                .expecting("Step completed");
            let mut plan = Plan::new(goal, vec![step]);
            plan.confidence = 0.1;
            plan
        }
        None => {
            let mut plan = Plan::new(goal, Vec::new());
            plan.confidence = 0.0;
            plan
        }
    }
}

fn catalog_listing(catalog: &ToolCatalog) -> String {
    let tools = catalog.tools.iter().map(|t| {
        format!(
            "- {}: {} (required: {})",
            t.name,
            t.description,
            t.input_schema.required.join(", ")
        )
    });
    let workflows = catalog
        .workflows
        .iter()
        .map(|w| format!("- {} [workflow]: {}", w.name, w.description));
    tools.chain(workflows).collect::<Vec<_>>().join("\n")
}

pub struct Planner {
    reasoner: Arc<dyn Reasoner>,
    runner: Arc<dyn ToolRunner>,
    memory: Option<Arc<dyn ExampleMemory>>,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl Planner {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        runner: Arc<dyn ToolRunner>,
        memory: Option<Arc<dyn ExampleMemory>>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            reasoner,
            runner,
            memory,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    async fn examples(&self, goal: &str) -> String {
        let Some(memory) = &self.memory else {
            return String::new();
        };
        match memory.similar(goal, EXAMPLE_LIMIT).await {
            Ok(hits) => hits
                .iter()
                .map(|e| format!("- \"{}\": {}", e.query, e.plan_summary))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                warn!(error = %e, "Example lookup failed");
                String::new()
            }
        }
    }

    /// Generate a first-version plan for `request.goal`
    pub async fn generate_plan(&self, request: &PlanRequest) -> Result<PlanDraft, EngineError> {
        let catalog = self.runner.catalog().await?;
        let context = if request.context.is_empty() {
            String::new()
        } else {
            serde_json::to_string_pretty(&request.context)?
        };
        let messages = self.assembler.assemble(
            PLANNER_INSTRUCTIONS,
            &[
                ("Catalog", catalog_listing(&catalog)),
                ("Similar past goals (hints only)", self.examples(&request.goal).await),
                ("Known values", context),
            ],
            &request.goal,
        );

        let raw = match generate_structured::<RawPlan>(self.reasoner.as_ref(), &messages, &self.options)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Planner output unusable, using default plan");
                return Ok(fallback_draft(&request.goal, &catalog));
            }
        };

        let (steps, dropped) = sanitize_steps(raw.steps, &catalog);
        if steps.is_empty() {
            warn!(dropped = dropped.len(), "Planner produced no usable steps, using default plan");
            return Ok(fallback_draft(&request.goal, &catalog));
        }

        let mut plan = Plan::new(request.goal.clone(), steps);
        if let Some(confidence) = raw.confidence {
            plan.confidence = confidence.clamp(0.0, 1.0);
        }
        if let Some(complexity) = raw.estimated_complexity {
            plan.estimated_complexity = complexity.clamp(0.0, 1.0);
        }
        let mut insights = raw.insights;
        if !dropped.is_empty() {
            debug!(dropped = ?dropped, "Dropped unknown actions from plan");
            insights.push(format!("unknown actions removed: {}", dropped.join(", ")));
        }

        info!(plan_id = %plan.id, steps = plan.steps.len(), "Plan generated");
        Ok(PlanDraft {
            plan,
            reasoning: raw.reasoning,
            recommended_tools: raw.recommended_tools,
            insights,
        })
    }
}

fn fallback_draft(goal: &str, catalog: &ToolCatalog) -> PlanDraft {
    let plan = default_plan(goal, catalog);
    PlanDraft {
        reasoning: "fallback plan: reasoner output was unusable".to_string(),
        recommended_tools: plan.steps.iter().map(|s| s.action.clone()).collect(),
        insights: Vec::new(),
        plan,
    }
}

#[async_trait]
impl Stage for Planner {
    type Input = PlanRequest;
    type Output = PlanDraft;

    fn name(&self) -> &'static str {
        "planner"
    }

    async fn prepare(&self, input: &mut PlanRequest) -> Result<(), EngineError> {
        input.goal = input.goal.trim().to_string();
        if input.goal.is_empty() {
            return Err(EngineError::InvalidPlan("goal is empty".to_string()));
        }
        Ok(())
    }

    async fn run(&self, input: &mut PlanRequest) -> Result<PlanDraft, EngineError> {
        self.generate_plan(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::memory::StaticExampleMemory;
    use crate::reasoner::scripted::ScriptedReasoner;
    use crate::tools::InMemoryToolRunner;
    use sdk::{ParamSpec, ToolSpec};
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new(
            vec![
                ToolSpec::new("list_facilities", "List every facility"),
                ToolSpec::new("get_facility", "Get one facility by id")
                    .with_required("facilityId", ParamSpec::of_type("string")),
            ],
            vec![],
        )
    }

    fn runner() -> Arc<dyn ToolRunner> {
        let mut runner = InMemoryToolRunner::new();
        for tool in catalog().tools {
            runner = runner.with_tool(tool, |_| Ok(json!({})));
        }
        Arc::new(runner)
    }

    fn raw(id: Option<&str>, action: &str, deps: &[&str]) -> RawStep {
        RawStep {
            id: id.map(str::to_string),
            action: action.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..RawStep::default()
        }
    }

    #[test]
    fn test_sanitize_steps() {
        let (steps, dropped) = sanitize_steps(
            vec![
                raw(Some("first"), "tools.list_facilities", &[]),
                raw(None, "teleport", &[]),
                raw(Some("first"), "get_facility", &["first", "ghost"]),
            ],
            &catalog(),
        );

        assert_eq!(dropped, vec!["teleport"]);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "first");
        assert_eq!(steps[0].action, "list_facilities");
        assert_eq!(steps[1].id, "step-2");
        assert_eq!(steps[1].order, 2);
        assert_eq!(steps[1].dependencies.iter().collect::<Vec<_>>(), vec!["first"]);
        assert_eq!(steps[1].description, "get_facility");
    }

    #[test]
    fn test_default_plan_picks_closest_tool() {
        let plan = default_plan("list all facilities in the region", &catalog());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, "list_facilities");
        assert!((plan.confidence - 0.1).abs() < 1e-9);

        let empty = default_plan("bake bread", &catalog());
        assert!(empty.steps.is_empty());
        assert_eq!(empty.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_generate_plan_from_reasoner() {
        let reply = r#"Sure! {"reasoning": "list then fetch", "confidence": 0.8,
            "steps": [
              {"id": "step-1", "description": "List", "action": "list_facilities"},
              {"id": "step-2", "description": "Fetch", "tool": "get_facility",
               "parameters": {"facilityId": "{{step-1.0.id}}"}, "dependencies": ["step-1"]}
            ], "recommendedTools": ["get_facility"]}"#;
        let reasoner = Arc::new(ScriptedReasoner::new().respond("You are the planner", reply));
        let planner = Planner::new(reasoner, runner(), None, GenerationOptions::default());

        let draft = planner
            .execute(&mut PlanRequest::new("  inspect a facility "))
            .await
            .unwrap();
        assert_eq!(draft.plan.goal, "inspect a facility");
        assert_eq!(draft.plan.steps.len(), 2);
        assert_eq!(draft.plan.version, 1);
        assert!((draft.plan.confidence - 0.8).abs() < 1e-9);
        assert!(draft.plan.structural_problems().is_empty());
        assert_eq!(draft.recommended_tools, vec!["get_facility"]);
    }

    #[tokio::test]
    async fn test_unusable_output_falls_back() {
        let reasoner = Arc::new(ScriptedReasoner::new().with_fallback("I cannot help with that."));
        let planner = Planner::new(reasoner, runner(), None, GenerationOptions::default());

        let draft = planner
            .execute(&mut PlanRequest::new("get facility details"))
            .await
            .unwrap();
        assert_eq!(draft.plan.steps.len(), 1);
        assert!(draft.reasoning.contains("fallback"));
    }

    #[tokio::test]
    async fn test_examples_reach_the_prompt() {
        let mut memory = StaticExampleMemory::default();
        memory.remember("inspect the north facility", "list_facilities -> get_facility");
        let reasoner = Arc::new(ScriptedReasoner::new().with_fallback("{}"));
        let planner = Planner::new(
            Arc::clone(&reasoner) as Arc<dyn Reasoner>,
            runner(),
            Some(Arc::new(memory)),
            GenerationOptions::default(),
        );

        planner
            .execute(&mut PlanRequest::new("inspect the south facility"))
            .await
            .unwrap();
        let calls = reasoner.calls();
        assert!(calls[0][0].content.contains("list_facilities -> get_facility"));
    }

    #[tokio::test]
    async fn test_empty_goal_is_rejected() {
        let planner = Planner::new(
            Arc::new(ScriptedReasoner::new()),
            runner(),
            None,
            GenerationOptions::default(),
        );
        let err = planner.execute(&mut PlanRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
    }
}
