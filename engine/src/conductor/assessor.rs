//! Quality Assessor
//!
//! Scores the reasoning behind a plan and decides whether to replan. The
//! first pass may name steps it doubts; those steps are re-validated and a
//! second pass sees the findings. The second pass replaces the first.

use crate::conductor::context::ContextAssembler;
use crate::conductor::types::{
    ConfidenceTrend, Critique, CritiqueHistory, Directive, IssueCategory, MetaAssessment,
    PatternAnalysis, Plan, PlanExecutionResult, QualityScores, StepId, ValidationFinding,
};
use crate::conductor::validator::ParameterValidator;
use crate::conductor::Stage;
use crate::config::AssessorConfig;
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use async_trait::async_trait;
use sdk::{errors::EngineError, Arguments};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ASSESSOR_INSTRUCTIONS: &str = "You are the quality assessor. Judge the reasoning \
behind this plan, its critique history and any execution so far.\n\
Respond with ONLY a JSON object:\n\
{\"reasoningQuality\": {\"logic\": 0-1, \"completeness\": 0-1, \"alignment\": 0-1, \"overall\": 0-1},\n \
\"shouldReplan\": true|false, \"shouldDeepenReasoning\": true|false, \
\"replanStrategy\": \"<what the next version must change>\",\n \
\"directives\": [{\"action\": \"remove_step|replace_tool|modify_parameter|add_step|reorder_steps|ask_user\", \
\"target\": \"<step id or tool name>\", \"detail\": \"...\"}],\n \
\"focusAreas\": [\"...\"], \"revalidateSteps\": [\"<step ids whose parameters look wrong>\"]}";

/// Difference in overall score that counts as a trend
const TREND_EPSILON: f64 = 0.05;

pub struct AssessmentInput {
    /// Free-text reasoning that produced the plan
    pub reasoning: String,
    pub plan: Plan,
    pub critique: Critique,
    pub history: CritiqueHistory,
    pub execution: Option<PlanExecutionResult>,
    pub context: Arguments,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawScores {
    logic: Option<f64>,
    completeness: Option<f64>,
    alignment: Option<f64>,
    overall: Option<f64>,
}

impl RawScores {
    fn is_empty(&self) -> bool {
        [self.logic, self.completeness, self.alignment, self.overall]
            .iter()
            .all(Option::is_none)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawAssessment {
    reasoning_quality: RawScores,
    should_replan: bool,
    should_deepen_reasoning: bool,
    replan_strategy: String,
    directives: Vec<Value>,
    focus_areas: Vec<String>,
    revalidate_steps: Vec<StepId>,
}

pub struct QualityAssessor {
    reasoner: Arc<dyn Reasoner>,
    validator: Arc<ParameterValidator>,
    config: AssessorConfig,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl QualityAssessor {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        validator: Arc<ParameterValidator>,
        config: AssessorConfig,
        options: GenerationOptions,
    ) -> Self {
        Self {
            reasoner,
            validator,
            config,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    async fn pass(
        &self,
        input: &AssessmentInput,
        patterns: &PatternAnalysis,
        revalidation: Option<&[ValidationFinding]>,
    ) -> Result<RawAssessment, EngineError> {
        let history: Vec<Value> = input
            .history
            .versions()
            .iter()
            .map(|c| {
                json!({
                    "version": c.version,
                    "overallScore": c.overall_score,
                    "recommendation": c.recommendation,
                    "issues": c.issues.len(),
                })
            })
            .collect();

        let mut sections = vec![
            ("Goal", input.plan.goal.clone()),
            ("Reasoning", input.reasoning.clone()),
            ("Plan", serde_json::to_string_pretty(&input.plan)?),
            ("Critique", serde_json::to_string_pretty(&input.critique)?),
            ("Confidence history", serde_json::to_string_pretty(&history)?),
            ("Pattern analysis", serde_json::to_string_pretty(patterns)?),
        ];
        if let Some(execution) = &input.execution {
            sections.push(("Execution", execution_summary(execution)));
        }
        if let Some(findings) = revalidation {
            let body = if findings.is_empty() {
                "The listed steps re-validated cleanly.".to_string()
            } else {
                serde_json::to_string_pretty(findings)?
            };
            sections.push(("Targeted re-validation", body));
        }

        let query = if revalidation.is_some() {
            "Re-assess the plan using the re-validation results."
        } else {
            "Assess this plan."
        };
        let messages = self.assembler.assemble(ASSESSOR_INSTRUCTIONS, &sections, query);
        let raw: RawAssessment =
            generate_structured(self.reasoner.as_ref(), &messages, &self.options).await?;
        if raw.reasoning_quality.is_empty() {
            return Err(EngineError::Reasoner(
                "assessment reply carried no quality scores".to_string(),
            ));
        }
        Ok(raw)
    }

    fn interpret(
        &self,
        raw: RawAssessment,
        patterns: PatternAnalysis,
        revalidation_findings: Vec<ValidationFinding>,
        pass: u8,
    ) -> MetaAssessment {
        let scores = quality_scores(&raw.reasoning_quality);
        let should_replan = raw.should_replan
            || scores.overall < self.config.low_score_threshold
            || scores.lowest_sub_score() < self.config.replan_threshold;

        let orchestrator_directives: Vec<Directive> = raw
            .directives
            .into_iter()
            .filter_map(|d| match serde_json::from_value::<Directive>(d) {
                Ok(directive) => Some(directive),
                Err(e) => {
                    debug!(error = %e, "Dropping malformed directive");
                    None
                }
            })
            .collect();

        MetaAssessment {
            reasoning_quality: scores,
            should_replan,
            should_deepen_reasoning: raw.should_deepen_reasoning,
            replan_strategy: raw.replan_strategy,
            orchestrator_directives,
            focus_areas: raw.focus_areas,
            pattern_analysis: patterns,
            revalidate_steps: raw.revalidate_steps,
            revalidation_findings,
            pass,
        }
    }
}

/// Scores as reported, clamped to [0, 1]. A missing overall is the mean of the
/// sub-scores that are present; a missing sub-score takes the overall.
fn quality_scores(raw: &RawScores) -> QualityScores {
    let clamp = |s: Option<f64>| s.map(|v| v.clamp(0.0, 1.0));
    let subs = [clamp(raw.logic), clamp(raw.completeness), clamp(raw.alignment)];
    let present: Vec<f64> = subs.iter().flatten().copied().collect();
    let overall = clamp(raw.overall).unwrap_or_else(|| {
        if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        }
    });
    QualityScores {
        logic: subs[0].unwrap_or(overall),
        completeness: subs[1].unwrap_or(overall),
        alignment: subs[2].unwrap_or(overall),
        overall,
    }
}

fn execution_summary(execution: &PlanExecutionResult) -> String {
    let errors: Vec<String> = execution
        .errors
        .iter()
        .map(|e| match &e.step_id {
            Some(step) => format!("{}: {}", step, e.message),
            None => e.message.clone(),
        })
        .collect();
    format!(
        "state: {:?}\nsuccess: {}\ncompleted steps: {}\nerrors:\n{}",
        execution.state,
        execution.overall_success,
        execution.partial_results.keys().cloned().collect::<Vec<_>>().join(", "),
        errors.join("\n")
    )
}

/// Issue categories seen in at least two critique versions, and the direction
/// of the overall score from the first version to the latest.
pub fn analyze_patterns(history: &CritiqueHistory) -> PatternAnalysis {
    let versions = history.versions();

    let mut seen: BTreeMap<IssueCategory, usize> = BTreeMap::new();
    for critique in versions {
        let categories: BTreeSet<IssueCategory> = critique.issues.iter().map(|i| i.category).collect();
        for category in categories {
            *seen.entry(category).or_default() += 1;
        }
    }
    let recurring_issues = seen
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .map(|(category, _)| category)
        .collect();

    let confidence_trend = match (versions.first(), versions.last()) {
        (Some(first), Some(last)) if versions.len() >= 2 => {
            let delta = last.overall_score - first.overall_score;
            if delta > TREND_EPSILON {
                ConfidenceTrend::Improving
            } else if delta < -TREND_EPSILON {
                ConfidenceTrend::Declining
            } else {
                ConfidenceTrend::Stable
            }
        }
        _ => ConfidenceTrend::Stable,
    };

    PatternAnalysis {
        recurring_issues,
        confidence_trend,
        versions_considered: versions.len(),
    }
}

/// Assessment used when the reasoner cannot give one: middling scores, no replan
pub fn conservative_assessment(patterns: PatternAnalysis) -> MetaAssessment {
    MetaAssessment {
        reasoning_quality: QualityScores {
            logic: 0.6,
            completeness: 0.6,
            alignment: 0.6,
            overall: 0.5,
        },
        should_replan: false,
        should_deepen_reasoning: false,
        replan_strategy: String::new(),
        orchestrator_directives: Vec::new(),
        focus_areas: Vec::new(),
        pattern_analysis: patterns,
        revalidate_steps: Vec::new(),
        revalidation_findings: Vec::new(),
        pass: 1,
    }
}

#[async_trait]
impl Stage for QualityAssessor {
    type Input = AssessmentInput;
    type Output = MetaAssessment;

    fn name(&self) -> &'static str {
        "assessor"
    }

    async fn run(&self, input: &mut AssessmentInput) -> Result<MetaAssessment, EngineError> {
        let patterns = analyze_patterns(&input.history);
        let first = self.pass(input, &patterns, None).await?;

        let targets: Vec<StepId> = first
            .revalidate_steps
            .iter()
            .filter(|id| input.plan.step(id).is_some())
            .cloned()
            .collect();
        if targets.is_empty() || !self.config.second_pass {
            let assessment = self.interpret(first, patterns, Vec::new(), 1);
            info!(
                plan_id = %input.plan.id,
                overall = assessment.reasoning_quality.overall,
                replan = assessment.should_replan,
                "Assessment complete"
            );
            return Ok(assessment);
        }

        let findings = self
            .validator
            .validate_steps(&input.plan, &targets, &input.context)
            .await?;
        debug!(plan_id = %input.plan.id, steps = ?targets, findings = findings.len(), "Re-validated steps");

        let assessment = match self.pass(input, &patterns, Some(&findings)).await {
            Ok(second) => self.interpret(second, patterns, findings, 2),
            Err(e) => {
                warn!(plan_id = %input.plan.id, error = %e, "Second assessment pass failed, keeping the first");
                self.interpret(first, patterns, findings, 1)
            }
        };
        info!(
            plan_id = %input.plan.id,
            overall = assessment.reasoning_quality.overall,
            replan = assessment.should_replan,
            pass = assessment.pass,
            "Assessment complete"
        );
        Ok(assessment)
    }

    async fn handle_error(
        &self,
        input: &AssessmentInput,
        error: EngineError,
    ) -> Result<MetaAssessment, EngineError> {
        warn!(plan_id = %input.plan.id, error = %error, "Using conservative assessment");
        Ok(conservative_assessment(analyze_patterns(&input.history)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::placeholder::DefaultPlaceholderPolicy;
    use crate::conductor::types::{Issue, Severity, Step};
    use crate::config::ValidatorConfig;
    use crate::reasoner::scripted::ScriptedReasoner;
    use crate::tools::InMemoryToolRunner;
    use sdk::{ParamSpec, ToolRunner, ToolSpec};

    fn assessor(reasoner: Arc<ScriptedReasoner>) -> QualityAssessor {
        let runner: Arc<dyn ToolRunner> = Arc::new(InMemoryToolRunner::new().with_tool(
            ToolSpec::new("get_facility", "Get")
                .with_required("facilityId", ParamSpec::of_type("string")),
            |_| Ok(json!({})),
        ));
        let config = ValidatorConfig::default();
        let policy = Arc::new(DefaultPlaceholderPolicy::new(&config).unwrap());
        QualityAssessor::new(
            reasoner,
            Arc::new(ParameterValidator::new(runner, policy, config)),
            AssessorConfig::default(),
            GenerationOptions::default(),
        )
    }

    fn input() -> AssessmentInput {
        let plan = Plan::new(
            "inspect the north facility",
            vec![Step::new("step-1", 1, "get_facility")],
        );
        let critique = Critique::neutral(&plan.id, 1);
        let mut history = CritiqueHistory::new();
        history.push(critique.clone());
        AssessmentInput {
            reasoning: "look it up directly".to_string(),
            plan,
            critique,
            history,
            execution: None,
            context: Arguments::new(),
        }
    }

    fn critique_with(version: u32, score: f64, categories: &[IssueCategory]) -> Critique {
        let mut critique = Critique::neutral("p", version);
        critique.overall_score = score;
        critique.issues = categories
            .iter()
            .map(|c| Issue {
                severity: Severity::Medium,
                category: *c,
                description: "x".to_string(),
                affected_steps: vec![],
            })
            .collect();
        critique
    }

    #[tokio::test]
    async fn test_low_sub_score_forces_replan() {
        let reply = r#"{"reasoningQuality": {"logic": 0.9, "completeness": 0.3, "alignment": 0.9, "overall": 0.8},
            "shouldReplan": false, "replanStrategy": "add the missing lookup"}"#;
        let assessor = assessor(Arc::new(ScriptedReasoner::new().respond("quality assessor", reply)));

        let assessment = assessor.execute(&mut input()).await.unwrap();
        assert!(assessment.should_replan);
        assert_eq!(assessment.pass, 1);
        assert_eq!(assessment.replan_strategy, "add the missing lookup");
    }

    #[tokio::test]
    async fn test_good_scores_do_not_replan() {
        let reply = r#"{"reasoningQuality": {"logic": 0.9, "completeness": 0.8, "alignment": 0.85},
            "shouldReplan": false, "directives": [{"action": "remove_step", "target": "step-1"}, {"bogus": 1}]}"#;
        let assessor = assessor(Arc::new(ScriptedReasoner::new().respond("quality assessor", reply)));

        let assessment = assessor.execute(&mut input()).await.unwrap();
        assert!(!assessment.should_replan);
        assert!((assessment.reasoning_quality.overall - 0.85).abs() < 1e-9);
        assert_eq!(assessment.orchestrator_directives.len(), 1);
    }

    #[tokio::test]
    async fn test_second_pass_supersedes_first() {
        // Rules are checked in order, so the re-validation section is matched first.
        let second = r#"{"reasoningQuality": {"logic": 0.4, "completeness": 0.4, "alignment": 0.4, "overall": 0.3},
            "shouldReplan": true, "replanStrategy": "ask for the facility"}"#;
        let first = r#"{"reasoningQuality": {"logic": 0.9, "completeness": 0.9, "alignment": 0.9, "overall": 0.9},
            "revalidateSteps": ["step-1", "step-99"]}"#;
        let reasoner = Arc::new(
            ScriptedReasoner::new()
                .respond("--- Targeted re-validation ---", second)
                .respond("quality assessor", first),
        );
        let assessor = assessor(Arc::clone(&reasoner));

        let assessment = assessor.execute(&mut input()).await.unwrap();
        assert_eq!(assessment.pass, 2);
        assert!(assessment.should_replan);
        assert_eq!(assessment.replan_strategy, "ask for the facility");
        assert_eq!(assessment.revalidation_findings.len(), 1);
        assert_eq!(assessment.revalidation_findings[0].parameter_name, "facilityId");
        assert_eq!(reasoner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_reasoner_failure_is_conservative() {
        let assessor = assessor(Arc::new(ScriptedReasoner::new().fail_on("quality assessor", "down")));

        let assessment = assessor.execute(&mut input()).await.unwrap();
        assert!(!assessment.should_replan);
        assert!((assessment.reasoning_quality.overall - 0.5).abs() < 1e-9);
        assert_eq!(assessment.pattern_analysis.versions_considered, 1);
    }

    #[tokio::test]
    async fn test_reply_without_scores_is_conservative() {
        let assessor = assessor(Arc::new(
            ScriptedReasoner::new().respond("quality assessor", r#"{"shouldDeepenReasoning": true}"#),
        ));

        let assessment = assessor.execute(&mut input()).await.unwrap();
        assert!(!assessment.should_replan);
        assert!((assessment.reasoning_quality.overall - 0.5).abs() < 1e-9);
        assert!(!assessment.should_deepen_reasoning);
    }

    #[test]
    fn test_pattern_analysis() {
        let mut history = CritiqueHistory::new();
        history.push(critique_with(1, 0.4, &[IssueCategory::MissingParameter, IssueCategory::Safety]));
        history.push(critique_with(2, 0.5, &[IssueCategory::MissingParameter]));
        history.push(critique_with(
            3,
            0.7,
            &[IssueCategory::MissingParameter, IssueCategory::MissingParameter],
        ));

        let patterns = analyze_patterns(&history);
        assert_eq!(patterns.recurring_issues, vec![IssueCategory::MissingParameter]);
        assert_eq!(patterns.confidence_trend, ConfidenceTrend::Improving);
        assert_eq!(patterns.versions_considered, 3);

        let mut flat = CritiqueHistory::new();
        flat.push(critique_with(1, 0.6, &[]));
        flat.push(critique_with(2, 0.62, &[]));
        assert_eq!(analyze_patterns(&flat).confidence_trend, ConfidenceTrend::Stable);
    }
}
