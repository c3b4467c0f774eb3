//! Plan critic
//!
//! Runs structural checks and the parameter validator, asks the reasoner for a
//! scored critique, then reconciles the two. Deterministic findings always
//! win: a plan with cycles or unknown tools is rejected whatever the reasoner
//! says, and a parameter only the user can supply caps feasibility.

use crate::conductor::context::{ContextAssembler, IdGenerator};
use crate::conductor::types::{
    Critique, FollowUpQuestion, Issue, IssueCategory, Plan, QuestionPriority, Recommendation,
    Severity, StepId, StructuralProblem,
};
use crate::conductor::validator::{ParameterValidator, ValidationReport};
use crate::conductor::Stage;
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use async_trait::async_trait;
use chrono::Utc;
use sdk::catalog::is_lookup_action;
use sdk::validation::identifier_entity;
use sdk::{errors::EngineError, Arguments};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const CRITIC_INSTRUCTIONS: &str = "You are the plan critic. Judge whether the plan below \
can achieve its goal with the available tools.\n\
Respond with ONLY a JSON object:\n\
{\"overallScore\": 0-1, \"feasibilityScore\": 0-1, \"correctnessScore\": 0-1, \
\"efficiencyScore\": 0-1, \"safetyScore\": 0-1,\n \
\"issues\": [{\"severity\": \"low|medium|high|critical\", \"category\": \"structure|missing_parameter|unknown_tool|dependency|feasibility|correctness|efficiency|safety\", \
\"description\": \"...\", \"affectedSteps\": [\"step-1\"]}],\n \
\"followUpQuestions\": [{\"question\": \"...\", \"priority\": \"low|medium|high\", \"stepId\": \"step-1\", \"parameter\": \"name\"}],\n \
\"recommendation\": \"approve|revise|reject\"}";

pub struct CriticInput {
    pub plan: Plan,
    /// Version number for the critique produced
    pub version: u32,
    /// Values the validator may infer parameters from
    pub context: Arguments,
}

#[derive(Debug, Clone)]
pub struct CritiqueOutcome {
    pub critique: Critique,
    pub report: ValidationReport,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawCritique {
    overall_score: Option<f64>,
    feasibility_score: Option<f64>,
    correctness_score: Option<f64>,
    efficiency_score: Option<f64>,
    safety_score: Option<f64>,
    issues: Vec<Issue>,
    follow_up_questions: Vec<RawQuestion>,
    recommendation: Option<Recommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuestion {
    #[serde(default)]
    id: Option<String>,
    question: String,
    #[serde(default)]
    priority: Option<QuestionPriority>,
    #[serde(default)]
    step_id: Option<StepId>,
    #[serde(default)]
    parameter: Option<String>,
}

pub struct Critic {
    reasoner: Arc<dyn Reasoner>,
    validator: Arc<ParameterValidator>,
    ids: Arc<IdGenerator>,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl Critic {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        validator: Arc<ParameterValidator>,
        ids: Arc<IdGenerator>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            reasoner,
            validator,
            ids,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    async fn judge(
        &self,
        plan: &Plan,
        report: &ValidationReport,
        version: u32,
    ) -> Result<Critique, EngineError> {
        let messages = self.assembler.assemble(
            CRITIC_INSTRUCTIONS,
            &[
                ("Goal", plan.goal.clone()),
                ("Plan", serde_json::to_string_pretty(plan)?),
                ("Validation findings", serde_json::to_string_pretty(&report.findings)?),
            ],
            "Critique this plan.",
        );
        let raw: RawCritique =
            generate_structured(self.reasoner.as_ref(), &messages, &self.options).await?;

        let clamp = |score: Option<f64>| score.map(|s| s.clamp(0.0, 1.0));
        let subs = [
            clamp(raw.feasibility_score),
            clamp(raw.correctness_score),
            clamp(raw.efficiency_score),
            clamp(raw.safety_score),
        ];
        let present: Vec<f64> = subs.iter().flatten().copied().collect();
        let overall = clamp(raw.overall_score).unwrap_or_else(|| {
            if present.is_empty() {
                0.5
            } else {
                present.iter().sum::<f64>() / present.len() as f64
            }
        });

        let follow_up_questions = raw
            .follow_up_questions
            .into_iter()
            .filter(|q| !q.question.trim().is_empty())
            .map(|q| FollowUpQuestion {
                id: q.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(|| self.ids.next("q")),
                question: q.question,
                priority: q.priority.unwrap_or(QuestionPriority::Medium),
                step_id: q.step_id,
                parameter: q.parameter,
                answer: None,
            })
            .collect();

        Ok(Critique {
            plan_id: plan.id.clone(),
            version,
            overall_score: overall,
            feasibility_score: subs[0].unwrap_or(0.5),
            correctness_score: subs[1].unwrap_or(0.5),
            efficiency_score: subs[2].unwrap_or(0.5),
            safety_score: subs[3].unwrap_or(0.5),
            issues: raw.issues,
            follow_up_questions,
            recommendation: raw.recommendation.unwrap_or(Recommendation::Approve),
            findings: Vec::new(),
            inconsistencies: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// Cap feasibility for parameters only the user can supply, unless every
    /// one of them can be pulled from an earlier lookup step at run time.
    fn apply_feasibility(
        &self,
        critique: &mut Critique,
        plan: &mut Plan,
        must_ask: &BTreeMap<StepId, Vec<String>>,
    ) {
        if must_ask.is_empty() {
            if critique.recommendation == Recommendation::ApproveWithDynamicFix {
                critique.recommendation = Recommendation::Approve;
            }
            return;
        }

        let mut all_fixable = true;
        for (step_id, params) in must_ask {
            let fixable = is_dynamic_fixable(plan, step_id, params);
            all_fixable &= fixable;
            let (severity, description) = if fixable {
                (
                    Severity::Medium,
                    format!(
                        "step '{}' is missing {}; it will be taken from an earlier lookup result at run time",
                        step_id,
                        params.join(", ")
                    ),
                )
            } else {
                (
                    Severity::High,
                    format!(
                        "step '{}' is missing {} and no tool can supply it",
                        step_id,
                        params.join(", ")
                    ),
                )
            };
            critique.issues.push(Issue {
                severity,
                category: IssueCategory::MissingParameter,
                description,
                affected_steps: vec![step_id.clone()],
            });
            self.sync_questions(critique, plan, step_id, params, fixable);
        }

        if critique.recommendation == Recommendation::Reject {
            return;
        }
        if all_fixable {
            critique.recommendation = Recommendation::ApproveWithDynamicFix;
        } else {
            critique.recommendation = Recommendation::Revise;
            critique.feasibility_score = 0.0;
            critique.overall_score = critique.overall_score.min(0.1);
            plan.confidence = plan.confidence.min(0.1);
        }
    }

    /// Make sure every must-ask parameter has exactly one question aimed at it.
    fn sync_questions(
        &self,
        critique: &mut Critique,
        plan: &Plan,
        step_id: &str,
        params: &[String],
        fixable: bool,
    ) {
        let priority = if fixable {
            QuestionPriority::Low
        } else {
            QuestionPriority::High
        };

        for param in params {
            if let Some(question) = critique
                .follow_up_questions
                .iter_mut()
                .find(|q| q.targets(step_id, param))
            {
                question.priority = priority;
                continue;
            }
            if let Some(question) = critique.follow_up_questions.iter_mut().find(|q| {
                q.step_id.as_deref().map_or(true, |s| s == step_id)
                    && q.parameter.is_none()
                    && q.question.contains(param.as_str())
            }) {
                question.step_id = Some(step_id.to_string());
                question.parameter = Some(param.clone());
                question.priority = priority;
                continue;
            }

            critique.inconsistencies.push(format!(
                "{}.{} needs user input but had no follow-up question",
                step_id, param
            ));
            let action = plan.step(step_id).map(|s| s.action.as_str()).unwrap_or("?");
            critique.follow_up_questions.push(FollowUpQuestion {
                id: self.ids.next("q"),
                question: format!(
                    "Step '{}' ({}) needs a value for '{}'. What should it be?",
                    step_id, action, param
                ),
                priority,
                step_id: Some(step_id.to_string()),
                parameter: Some(param.clone()),
                answer: None,
            });
        }
    }
}

/// An earlier step lists or searches, and every missing parameter names an
/// identifier that such a result would carry.
fn is_dynamic_fixable(plan: &Plan, step_id: &str, params: &[String]) -> bool {
    let has_lookup_before = plan
        .steps_before(step_id)
        .iter()
        .any(|s| is_lookup_action(&s.action));
    has_lookup_before && params.iter().all(|p| identifier_entity(p).is_some())
}

fn structural_issue(problem: &StructuralProblem) -> Issue {
    let category = match problem {
        StructuralProblem::DanglingDependency { .. } | StructuralProblem::DependencyCycle(_) => {
            IssueCategory::Dependency
        }
        _ => IssueCategory::Structure,
    };
    Issue {
        severity: Severity::Critical,
        category,
        description: problem.to_string(),
        affected_steps: problem.affected_steps(),
    }
}

#[async_trait]
impl Stage for Critic {
    type Input = CriticInput;
    type Output = CritiqueOutcome;

    fn name(&self) -> &'static str {
        "critic"
    }

    async fn run(&self, input: &mut CriticInput) -> Result<CritiqueOutcome, EngineError> {
        let plan = &mut input.plan;
        let mut issues: Vec<Issue> = plan.structural_problems().iter().map(structural_issue).collect();

        let report = self
            .validator
            .validate_and_resolve(plan, &input.context)
            .await?;
        for step_id in &report.unknown_actions {
            let action = plan.step(step_id).map(|s| s.action.clone()).unwrap_or_default();
            issues.push(Issue {
                severity: Severity::Critical,
                category: IssueCategory::UnknownTool,
                description: format!(
                    "step '{}' uses '{}' which is not in the tool catalog",
                    step_id, action
                ),
                affected_steps: vec![step_id.clone()],
            });
        }
        if plan.steps.is_empty() {
            issues.push(Issue {
                severity: Severity::Medium,
                category: IssueCategory::Feasibility,
                description: "plan has no steps".to_string(),
                affected_steps: Vec::new(),
            });
        }

        let blocked = issues.iter().any(|i| i.severity == Severity::Critical);
        let mut critique = if blocked {
            let mut rejected = Critique::neutral(&plan.id, input.version);
            rejected.recommendation = Recommendation::Reject;
            rejected.feasibility_score = 0.0;
            rejected.overall_score = 0.1;
            rejected
        } else {
            match self.judge(plan, &report, input.version).await {
                Ok(critique) => critique,
                Err(e) => {
                    warn!(plan_id = %plan.id, error = %e, "Critique unavailable, using neutral scores");
                    Critique::neutral(&plan.id, input.version)
                }
            }
        };

        issues.append(&mut critique.issues);
        critique.issues = issues;
        critique.findings = report.findings.clone();

        let mut must_ask: BTreeMap<StepId, Vec<String>> = BTreeMap::new();
        for finding in report.must_ask_user() {
            must_ask
                .entry(finding.step_id.clone())
                .or_default()
                .push(finding.parameter_name.clone());
        }
        self.apply_feasibility(&mut critique, plan, &must_ask);

        info!(
            plan_id = %plan.id,
            version = critique.version,
            recommendation = ?critique.recommendation,
            overall = critique.overall_score,
            issues = critique.issues.len(),
            "Plan critiqued"
        );
        Ok(CritiqueOutcome { critique, report })
    }

    async fn handle_error(
        &self,
        input: &CriticInput,
        error: EngineError,
    ) -> Result<CritiqueOutcome, EngineError> {
        warn!(plan_id = %input.plan.id, error = %error, "Validation failed, using neutral critique");
        Ok(CritiqueOutcome {
            critique: Critique::neutral(&input.plan.id, input.version),
            report: ValidationReport::default(),
        })
    }
}
