//! Conductor data model
//!
//! Plans, steps, critiques, execution records and assessments. Every type here
//! is a plain serde record; the JSON forms use camelCase keys and are what the
//! CLI reads and writes.

use chrono::{DateTime, Utc};
use sdk::Arguments;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

pub type StepId = String;

/// Lifecycle of a single step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One tool or workflow invocation within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub order: u32,
    #[serde(default)]
    pub description: String,
    /// Tool or workflow template name
    pub action: String,
    #[serde(default)]
    pub parameters: Arguments,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub dependencies: BTreeSet<StepId>,
    #[serde(default)]
    pub status: StepStatus,
}

impl Step {
    pub fn new(id: impl Into<StepId>, order: u32, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order,
            description: String::new(),
            action: action.into(),
            parameters: Arguments::new(),
            expected_outcome: String::new(),
            dependencies: BTreeSet::new(),
            status: StepStatus::Pending,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    pub fn expecting(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = outcome.into();
        self
    }

    /// Same description, action, parameters, outcome and dependencies.
    ///
    /// Status and order are execution bookkeeping and do not count as a change.
    pub fn content_eq(&self, other: &Step) -> bool {
        self.description == other.description
            && self.action == other.action
            && self.parameters == other.parameters
            && self.expected_outcome == other.expected_outcome
            && self.dependencies == other.dependencies
    }
}

fn first_version() -> u32 {
    1
}

/// A versioned graph of steps toward a goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub estimated_complexity: f64,
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Root of the replan chain this plan belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_plan_id: Option<String>,
}

/// A structural defect that makes a plan unschedulable as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralProblem {
    DuplicateId(StepId),
    NonIncreasingOrder { step_id: StepId, order: u32 },
    DanglingDependency { step_id: StepId, dependency: StepId },
    DependencyCycle(Vec<StepId>),
}

impl StructuralProblem {
    pub fn affected_steps(&self) -> Vec<StepId> {
        match self {
            Self::DuplicateId(id) => vec![id.clone()],
            Self::NonIncreasingOrder { step_id, .. } => vec![step_id.clone()],
            Self::DanglingDependency { step_id, .. } => vec![step_id.clone()],
            Self::DependencyCycle(ids) => ids.clone(),
        }
    }
}

impl fmt::Display for StructuralProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "step id '{}' is used more than once", id),
            Self::NonIncreasingOrder { step_id, order } => write!(
                f,
                "step '{}' has order {} which does not increase on the previous step",
                step_id, order
            ),
            Self::DanglingDependency {
                step_id,
                dependency,
            } => write!(
                f,
                "step '{}' depends on '{}' which is not in the plan",
                step_id, dependency
            ),
            Self::DependencyCycle(ids) => {
                write!(f, "steps {} depend on each other in a cycle", ids.join(", "))
            }
        }
    }
}

impl Plan {
    /// Create a first-version plan
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            steps,
            confidence: 0.5,
            estimated_complexity: 0.5,
            version: 1,
            created_at: Utc::now(),
            original_plan_id: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> BTreeSet<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Id of the first plan in this replan chain
    pub fn root_id(&self) -> &str {
        self.original_plan_id.as_deref().unwrap_or(&self.id)
    }

    /// Steps that come strictly before `step_id` in plan order
    pub fn steps_before(&self, step_id: &str) -> Vec<&Step> {
        match self.step(step_id) {
            Some(target) => self.steps.iter().filter(|s| s.order < target.order).collect(),
            None => Vec::new(),
        }
    }

    /// Duplicate ids, non-increasing order numbers, dangling references and cycles
    pub fn structural_problems(&self) -> Vec<StructuralProblem> {
        let mut problems = Vec::new();
        let mut seen = BTreeSet::new();
        let mut last_order: Option<u32> = None;

        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                problems.push(StructuralProblem::DuplicateId(step.id.clone()));
            }
            if last_order.is_some_and(|last| step.order <= last) {
                problems.push(StructuralProblem::NonIncreasingOrder {
                    step_id: step.id.clone(),
                    order: step.order,
                });
            }
            last_order = Some(step.order);
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    problems.push(StructuralProblem::DanglingDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let cyclic = self.cyclic_steps();
        if !cyclic.is_empty() {
            problems.push(StructuralProblem::DependencyCycle(cyclic));
        }

        problems
    }

    /// Steps that can never become ready because they sit on (or behind) a cycle
    fn cyclic_steps(&self) -> Vec<StepId> {
        let known = self.step_ids();
        let mut remaining: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| {
                let deps = s.dependencies.iter().filter(|d| known.contains(*d)).count();
                (s.id.as_str(), deps)
            })
            .collect();
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut resolved = BTreeSet::new();

        while let Some(id) = ready.pop() {
            if !resolved.insert(id) {
                continue;
            }
            for step in &self.steps {
                if step.dependencies.contains(id) {
                    if let Some(n) = remaining.get_mut(step.id.as_str()) {
                        *n = n.saturating_sub(1);
                        if *n == 0 {
                            ready.push(step.id.as_str());
                        }
                    }
                }
            }
        }

        self.steps
            .iter()
            .filter(|s| !resolved.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Remediation path for a missing parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FindingCategory {
    Resolvable,
    CanInfer,
    MustAskUser,
}

/// A categorized missing or placeholder parameter on a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    pub step_id: StepId,
    pub parameter_name: String,
    pub category: FindingCategory,
}

/// Classification of a terminal step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    MissingData,
    ValidationError,
    CoordinationError,
    ToolError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MissingData => "missing-data",
            ErrorKind::ValidationError => "validation-error",
            ErrorKind::CoordinationError => "coordination-error",
            ErrorKind::ToolError => "tool-error",
        };
        f.write_str(s)
    }
}

/// Record of one step execution. Never modified after it is pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub step_id: StepId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Number of invocation attempts made
    pub retries: u32,
    pub duration_ms: u64,
    pub tool_called: String,
    #[serde(default)]
    pub parameters_used: Arguments,
}

/// Auditable parameter rewrite applied during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    pub step_id: StepId,
    pub before: Arguments,
    pub after: Arguments,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A step switched to a different tool by recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adaptation {
    pub step_id: StepId,
    pub original_action: String,
    pub new_action: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionPriority {
    Low,
    Medium,
    High,
}

/// A question for the human in the loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpQuestion {
    pub id: String,
    pub question: String,
    pub priority: QuestionPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// Parameter the answer is written into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl FollowUpQuestion {
    pub fn is_answered(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.trim().is_empty())
    }

    /// Whether this question asks for `parameter` of `step_id`
    pub fn targets(&self, step_id: &str, parameter: &str) -> bool {
        self.step_id.as_deref() == Some(step_id) && self.parameter.as_deref() == Some(parameter)
    }
}

/// Scheduler state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    NotStarted,
    Running,
    Completed,
    PausedForFeedback,
    Deadlocked,
}

/// An outstanding error in an execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Aggregate output of a (possibly partial) plan execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecutionResult {
    pub plan_id: String,
    #[serde(default)]
    pub execution_results: Vec<ExecutionResult>,
    /// Outputs of succeeded steps, the resumption basis
    #[serde(default)]
    pub partial_results: BTreeMap<StepId, Value>,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub questions_asked: Vec<FollowUpQuestion>,
    #[serde(default)]
    pub adaptations: Vec<Adaptation>,
    #[serde(default)]
    pub plan_updates: Vec<PlanUpdate>,
    #[serde(default)]
    pub state: ExecutionState,
    #[serde(default)]
    pub overall_success: bool,
}

impl PlanExecutionResult {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ..Default::default()
        }
    }

    /// Questions still waiting for an answer
    pub fn pending_questions(&self) -> impl Iterator<Item = &FollowUpQuestion> {
        self.questions_asked.iter().filter(|q| !q.is_answered())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Structure,
    MissingParameter,
    UnknownTool,
    Dependency,
    Feasibility,
    Correctness,
    Efficiency,
    Safety,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: Severity,
    pub category: IssueCategory,
    pub description: String,
    #[serde(default)]
    pub affected_steps: Vec<StepId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Approve,
    Revise,
    Reject,
    ApproveWithDynamicFix,
}

/// Versioned verdict on a plan. Superseded by later versions, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Critique {
    pub plan_id: String,
    pub version: u32,
    pub overall_score: f64,
    pub feasibility_score: f64,
    pub correctness_score: f64,
    pub efficiency_score: f64,
    pub safety_score: f64,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub follow_up_questions: Vec<FollowUpQuestion>,
    pub recommendation: Recommendation,
    #[serde(default)]
    pub findings: Vec<ValidationFinding>,
    /// Findings that had no matching question when the critique was built
    #[serde(default)]
    pub inconsistencies: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Critique {
    /// Mid-range critique used when no better judgement is available
    pub fn neutral(plan_id: impl Into<String>, version: u32) -> Self {
        Self {
            plan_id: plan_id.into(),
            version,
            overall_score: 0.5,
            feasibility_score: 0.5,
            correctness_score: 0.5,
            efficiency_score: 0.5,
            safety_score: 0.5,
            issues: Vec::new(),
            follow_up_questions: Vec::new(),
            recommendation: Recommendation::Revise,
            findings: Vec::new(),
            inconsistencies: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Steps named by a high or critical issue
    pub fn high_severity_steps(&self) -> BTreeSet<StepId> {
        self.issues
            .iter()
            .filter(|i| i.severity >= Severity::High)
            .flat_map(|i| i.affected_steps.iter().cloned())
            .collect()
    }

    /// Steps named by a critical issue
    pub fn critical_steps(&self) -> BTreeSet<StepId> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .flat_map(|i| i.affected_steps.iter().cloned())
            .collect()
    }
}

/// All critique versions produced for one logical plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CritiqueHistory {
    versions: Vec<Critique>,
}

impl CritiqueHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, critique: Critique) {
        self.versions.push(critique);
    }

    pub fn latest(&self) -> Option<&Critique> {
        self.versions.last()
    }

    pub fn versions(&self) -> &[Critique] {
        &self.versions
    }

    /// Version number for the next critique
    pub fn next_version(&self) -> u32 {
        self.versions.last().map_or(1, |c| c.version + 1)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScores {
    #[serde(default)]
    pub logic: f64,
    #[serde(default)]
    pub completeness: f64,
    #[serde(default)]
    pub alignment: f64,
    #[serde(default)]
    pub overall: f64,
}

impl QualityScores {
    pub fn lowest_sub_score(&self) -> f64 {
        self.logic.min(self.completeness).min(self.alignment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveAction {
    RemoveStep,
    ReplaceTool,
    ModifyParameter,
    AddStep,
    ReorderSteps,
    AskUser,
    #[serde(other)]
    Other,
}

/// Concrete routing instruction for the replanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub action: DirectiveAction,
    /// Step id or tool name the directive refers to
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTrend {
    Improving,
    Declining,
    #[default]
    Stable,
}

/// What the critique history says across versions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternAnalysis {
    pub recurring_issues: Vec<IssueCategory>,
    pub confidence_trend: ConfidenceTrend,
    pub versions_considered: usize,
}

/// Output of one assessment cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaAssessment {
    pub reasoning_quality: QualityScores,
    pub should_replan: bool,
    pub should_deepen_reasoning: bool,
    pub replan_strategy: String,
    #[serde(default)]
    pub orchestrator_directives: Vec<Directive>,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub pattern_analysis: PatternAnalysis,
    /// Steps the assessor asked to have re-validated
    #[serde(default)]
    pub revalidate_steps: Vec<StepId>,
    /// Findings from the targeted re-validation (pass 2 only)
    #[serde(default)]
    pub revalidation_findings: Vec<ValidationFinding>,
    /// 1 or 2
    pub pass: u8,
}

/// Step-id sets between two plan versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplanDiff {
    pub original_plan_id: String,
    pub new_plan_id: String,
    pub from_version: u32,
    pub to_version: u32,
    pub added_steps: Vec<StepId>,
    pub removed_steps: Vec<StepId>,
    pub modified_steps: Vec<StepId>,
}

impl ReplanDiff {
    pub fn is_empty(&self) -> bool {
        self.added_steps.is_empty() && self.removed_steps.is_empty() && self.modified_steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new("goal", steps)
    }

    #[test]
    fn test_well_formed_plan_has_no_problems() {
        let p = plan(vec![
            Step::new("step-1", 1, "list_facilities"),
            Step::new("step-2", 2, "get_facility").depends_on("step-1"),
        ]);
        assert!(p.structural_problems().is_empty());
    }

    #[test]
    fn test_structural_problems_detected() {
        let p = plan(vec![
            Step::new("step-1", 2, "a"),
            Step::new("step-1", 1, "b"),
            Step::new("step-3", 3, "c").depends_on("step-9"),
        ]);
        let problems = p.structural_problems();
        assert!(problems.contains(&StructuralProblem::DuplicateId("step-1".to_string())));
        assert!(problems
            .iter()
            .any(|p| matches!(p, StructuralProblem::NonIncreasingOrder { order: 1, .. })));
        assert!(problems.iter().any(|p| matches!(
            p,
            StructuralProblem::DanglingDependency { dependency, .. } if dependency == "step-9"
        )));
    }

    #[test]
    fn test_cycle_detected() {
        let p = plan(vec![
            Step::new("a", 1, "x").depends_on("b"),
            Step::new("b", 2, "x").depends_on("a"),
            Step::new("c", 3, "x"),
        ]);
        let problems = p.structural_problems();
        assert_eq!(
            problems,
            vec![StructuralProblem::DependencyCycle(vec![
                "a".to_string(),
                "b".to_string()
            ])]
        );
    }

    #[test]
    fn test_content_eq_ignores_status() {
        let a = Step::new("s", 1, "tool").with_param("x", json!(1));
        let mut b = a.clone();
        b.status = StepStatus::Succeeded;
        assert!(a.content_eq(&b));
        b.parameters.insert("x".to_string(), json!(2));
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn test_json_shape() {
        let mut result = PlanExecutionResult::new("p-1");
        result.state = ExecutionState::PausedForFeedback;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "paused_for_feedback");
        assert_eq!(json["overallSuccess"], false);
        assert!(json["questionsAsked"].as_array().unwrap().is_empty());

        let rec = serde_json::to_value(Recommendation::ApproveWithDynamicFix).unwrap();
        assert_eq!(rec, "approve-with-dynamic-fix");
    }

    #[test]
    fn test_plan_defaults_when_fields_missing() {
        let p: Plan = serde_json::from_value(json!({
            "id": "p",
            "goal": "g",
            "steps": [{"id": "step-1", "order": 1, "action": "list_facilities"}]
        }))
        .unwrap();
        assert_eq!(p.version, 1);
        assert_eq!(p.steps[0].status, StepStatus::Pending);
        assert_eq!(p.root_id(), "p");
    }

    #[test]
    fn test_unknown_issue_category_is_other() {
        let issue: Issue = serde_json::from_value(json!({
            "severity": "high",
            "category": "vibes",
            "description": "d"
        }))
        .unwrap();
        assert_eq!(issue.category, IssueCategory::Other);
    }

    #[test]
    fn test_high_severity_steps() {
        let mut critique = Critique::neutral("p", 1);
        critique.issues.push(Issue {
            severity: Severity::Critical,
            category: IssueCategory::Correctness,
            description: "wrong".to_string(),
            affected_steps: vec!["step-2".to_string()],
        });
        critique.issues.push(Issue {
            severity: Severity::Low,
            category: IssueCategory::Efficiency,
            description: "slow".to_string(),
            affected_steps: vec!["step-3".to_string()],
        });
        assert_eq!(
            critique.high_severity_steps().into_iter().collect::<Vec<_>>(),
            vec!["step-2"]
        );
        assert_eq!(critique.critical_steps().len(), 1);
    }
}
