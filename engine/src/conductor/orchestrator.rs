//! Conductor
//!
//! Wires the stages together and runs the control loop:
//!
//! ```text
//! plan -> critique -> execute -> assess -> (replan -> critique -> ...)
//! ```
//!
//! A rejected plan goes straight to the replanner. A run that needs the user
//! stops with [`CycleOutcome::AwaitingInput`] and can be resumed with answers.

use crate::conductor::assessor::{AssessmentInput, QualityAssessor};
use crate::conductor::context::IdGenerator;
use crate::conductor::coordination::Coordinator;
use crate::conductor::critic::{Critic, CriticInput, CritiqueOutcome};
use crate::conductor::memory::ExampleMemory;
use crate::conductor::placeholder::{DefaultPlaceholderPolicy, PlaceholderPolicy};
use crate::conductor::planner::{PlanDraft, PlanRequest, Planner};
use crate::conductor::recovery::RecoveryAdvisor;
use crate::conductor::replanner::{ReplanInput, ReplanOutput, Replanner};
use crate::conductor::scheduler::{ExecutionInput, Scheduler};
use crate::conductor::types::{
    Critique, CritiqueHistory, ExecutionState, MetaAssessment, Plan, PlanExecutionResult,
    Recommendation, ReplanDiff,
};
use crate::conductor::validator::ParameterValidator;
use crate::conductor::Stage;
use crate::config::Config;
use crate::reasoner::{self, GenerationOptions, Reasoner};
use sdk::{errors::EngineError, Arguments, ToolCatalog, ToolRunner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleOutcome {
    /// Every step succeeded
    Completed,
    /// Paused; the latest execution lists the open questions
    AwaitingInput,
    /// Ran out of cycles without a successful execution
    Exhausted,
    /// Pending steps can never become ready
    Deadlocked,
}

/// Everything a run produced. Also the saved form of a paused session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub plan: Plan,
    pub critiques: CritiqueHistory,
    pub execution: Option<PlanExecutionResult>,
    pub assessment: Option<MetaAssessment>,
    #[serde(default)]
    pub diffs: Vec<ReplanDiff>,
    pub cycles: u32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub recommended_tools: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
}

impl CycleReport {
    fn start(plan: Plan, reasoning: String) -> Self {
        Self {
            outcome: CycleOutcome::Exhausted,
            plan,
            critiques: CritiqueHistory::new(),
            execution: None,
            assessment: None,
            diffs: Vec::new(),
            cycles: 0,
            reasoning,
            recommended_tools: Vec::new(),
            insights: Vec::new(),
        }
    }
}

pub struct Conductor {
    runner: Arc<dyn ToolRunner>,
    ids: Arc<IdGenerator>,
    planner: Planner,
    critic: Critic,
    scheduler: Scheduler,
    assessor: QualityAssessor,
    replanner: Replanner,
    context: Arguments,
    max_cycles: u32,
}

impl Conductor {
    /// Build every stage from `config`.
    ///
    /// Fails before any plan work when no reasoner is configured.
    pub fn new(
        config: &Config,
        reasoner: Option<Arc<dyn Reasoner>>,
        runner: Arc<dyn ToolRunner>,
        memory: Option<Arc<dyn ExampleMemory>>,
    ) -> Result<Self, EngineError> {
        let reasoner = reasoner.ok_or(EngineError::ReasonerNotConfigured)?;
        let policy: Arc<dyn PlaceholderPolicy> =
            Arc::new(DefaultPlaceholderPolicy::new(&config.validator)?);
        Ok(Self::with_policy(config, reasoner, runner, memory, policy))
    }

    /// Reasoner built from the `[reasoner]` section
    pub fn from_config(config: &Config, runner: Arc<dyn ToolRunner>) -> Result<Self, EngineError> {
        let reasoner = reasoner::from_config(&config.reasoner)?;
        Self::new(config, Some(reasoner), runner, None)
    }

    /// Same as [`Conductor::new`] with a custom placeholder policy
    pub fn with_policy(
        config: &Config,
        reasoner: Arc<dyn Reasoner>,
        runner: Arc<dyn ToolRunner>,
        memory: Option<Arc<dyn ExampleMemory>>,
        policy: Arc<dyn PlaceholderPolicy>,
    ) -> Self {
        let options = GenerationOptions::default()
            .with_temperature(config.reasoner.temperature)
            .with_max_output_tokens(config.reasoner.max_output_tokens);
        let ids = Arc::new(IdGenerator::new());
        let validator = Arc::new(ParameterValidator::new(
            Arc::clone(&runner),
            Arc::clone(&policy),
            config.validator.clone(),
        ));

        Self {
            planner: Planner::new(
                Arc::clone(&reasoner),
                Arc::clone(&runner),
                memory,
                options.clone(),
            ),
            critic: Critic::new(
                Arc::clone(&reasoner),
                Arc::clone(&validator),
                Arc::clone(&ids),
                options.clone(),
            ),
            scheduler: Scheduler::new(
                Arc::clone(&runner),
                Coordinator::new(Arc::clone(&reasoner), Arc::clone(&policy), options.clone()),
                RecoveryAdvisor::new(Arc::clone(&reasoner), options.clone()),
                policy,
                Arc::clone(&ids),
                config.executor.clone(),
            ),
            assessor: QualityAssessor::new(
                Arc::clone(&reasoner),
                validator,
                config.assessor.clone(),
                options.clone(),
            ),
            replanner: Replanner::new(reasoner, Arc::clone(&runner), options),
            runner,
            ids,
            context: Arguments::new(),
            max_cycles: config.conductor.max_cycles.max(1),
        }
    }

    /// Values the validator may infer parameters from
    pub fn with_context(mut self, context: Arguments) -> Self {
        self.context = context;
        self
    }

    pub async fn catalog(&self) -> Result<ToolCatalog, EngineError> {
        self.runner.catalog().await
    }

    pub async fn plan(&self, goal: &str) -> Result<PlanDraft, EngineError> {
        let mut request = PlanRequest {
            goal: goal.to_string(),
            context: self.context.clone(),
        };
        self.planner.execute(&mut request).await
    }

    /// Validate and critique `plan`, writing resolved values back into it
    pub async fn critique(&self, plan: &mut Plan, version: u32) -> Result<CritiqueOutcome, EngineError> {
        let mut input = CriticInput {
            plan: plan.clone(),
            version,
            context: self.context.clone(),
        };
        let outcome = self.critic.execute(&mut input).await?;
        *plan = input.plan;
        Ok(outcome)
    }

    pub async fn execute(
        &self,
        plan: &mut Plan,
        critique: &Critique,
    ) -> Result<PlanExecutionResult, EngineError> {
        let mut input = ExecutionInput::new(plan.clone(), critique.clone());
        let result = Stage::execute(&self.scheduler, &mut input).await?;
        *plan = input.plan;
        Ok(result)
    }

    /// Continue a paused execution with answers keyed by question id
    pub async fn resume_execution(
        &self,
        plan: &mut Plan,
        critique: &Critique,
        previous: PlanExecutionResult,
        answers: BTreeMap<String, String>,
    ) -> Result<PlanExecutionResult, EngineError> {
        self.reserve_question_ids(previous.questions_asked.iter().map(|q| q.id.as_str()));
        self.reserve_question_ids(critique.follow_up_questions.iter().map(|q| q.id.as_str()));
        let mut input = ExecutionInput::new(plan.clone(), critique.clone()).resuming(previous, answers);
        let result = Stage::execute(&self.scheduler, &mut input).await?;
        *plan = input.plan;
        Ok(result)
    }

    pub async fn assess(&self, mut input: AssessmentInput) -> Result<MetaAssessment, EngineError> {
        self.assessor.execute(&mut input).await
    }

    pub async fn replan(&self, mut input: ReplanInput) -> Result<ReplanOutput, EngineError> {
        self.replanner.execute(&mut input).await
    }

    /// Plan `goal` and run the full cycle
    pub async fn run_goal(&self, goal: &str) -> Result<CycleReport, EngineError> {
        let draft = self.plan(goal).await?;
        let mut report = CycleReport::start(draft.plan, draft.reasoning);
        report.recommended_tools = draft.recommended_tools;
        report.insights = draft.insights;
        self.cycle(report, None).await
    }

    /// Run the full cycle on an existing plan
    pub async fn run_plan(&self, plan: Plan) -> Result<CycleReport, EngineError> {
        self.cycle(CycleReport::start(plan, String::new()), None).await
    }

    /// Continue a run that stopped awaiting input
    pub async fn resume(
        &self,
        mut report: CycleReport,
        answers: BTreeMap<String, String>,
    ) -> Result<CycleReport, EngineError> {
        let (Some(previous), Some(critique)) = (report.execution.take(), report.critiques.latest().cloned())
        else {
            return Err(EngineError::InvalidPlan(
                "session has no paused execution to resume".to_string(),
            ));
        };
        if report.outcome != CycleOutcome::AwaitingInput {
            warn!(outcome = ?report.outcome, "Resuming a session that was not awaiting input");
        }

        let execution = self
            .resume_execution(&mut report.plan, &critique, previous, answers)
            .await?;
        self.cycle(report, Some(execution)).await
    }

    fn reserve_question_ids<'a>(&self, ids: impl Iterator<Item = &'a str>) {
        for n in ids.filter_map(|id| id.strip_prefix("q-")?.parse::<u64>().ok()) {
            self.ids.advance_past(n);
        }
    }

    async fn cycle(
        &self,
        mut report: CycleReport,
        mut resumed: Option<PlanExecutionResult>,
    ) -> Result<CycleReport, EngineError> {
        loop {
            let (critique, execution) = match resumed.take() {
                Some(execution) => {
                    let critique = report.critiques.latest().cloned().ok_or_else(|| {
                        EngineError::InvalidPlan("no critique for the resumed plan".to_string())
                    })?;
                    (critique, execution)
                }
                None => {
                    if report.cycles >= self.max_cycles {
                        report.outcome = CycleOutcome::Exhausted;
                        info!(cycles = report.cycles, "Cycle budget exhausted");
                        return Ok(report);
                    }
                    report.cycles += 1;
                    self.reserve_question_ids(
                        report
                            .critiques
                            .versions()
                            .iter()
                            .flat_map(|c| c.follow_up_questions.iter())
                            .map(|q| q.id.as_str()),
                    );

                    let version = report.critiques.next_version();
                    let CritiqueOutcome { critique, .. } =
                        self.critique(&mut report.plan, version).await?;
                    report.critiques.push(critique.clone());
                    info!(
                        cycle = report.cycles,
                        plan_id = %report.plan.id,
                        version = report.plan.version,
                        recommendation = ?critique.recommendation,
                        "Plan critiqued"
                    );

                    if critique.recommendation == Recommendation::Reject {
                        self.revise(&mut report, critique, None).await?;
                        continue;
                    }
                    let execution = self.execute(&mut report.plan, &critique).await?;
                    (critique, execution)
                }
            };

            match execution.state {
                ExecutionState::PausedForFeedback => {
                    report.execution = Some(execution);
                    report.outcome = CycleOutcome::AwaitingInput;
                    return Ok(report);
                }
                ExecutionState::Deadlocked => {
                    report.execution = Some(execution);
                    report.outcome = CycleOutcome::Deadlocked;
                    return Ok(report);
                }
                _ => {}
            }

            let assessment = self
                .assess(AssessmentInput {
                    reasoning: report.reasoning.clone(),
                    plan: report.plan.clone(),
                    critique: critique.clone(),
                    history: report.critiques.clone(),
                    execution: Some(execution.clone()),
                    context: self.context.clone(),
                })
                .await?;
            let success = execution.overall_success;
            report.execution = Some(execution);
            report.assessment = Some(assessment.clone());

            if success {
                if assessment.should_replan {
                    info!(
                        strategy = %assessment.replan_strategy,
                        "Execution succeeded; assessor suggestions recorded only"
                    );
                }
                report.outcome = CycleOutcome::Completed;
                return Ok(report);
            }
            if report.cycles >= self.max_cycles {
                report.outcome = CycleOutcome::Exhausted;
                return Ok(report);
            }
            self.revise(&mut report, critique, Some(assessment)).await?;
        }
    }

    async fn revise(
        &self,
        report: &mut CycleReport,
        critique: Critique,
        assessment: Option<MetaAssessment>,
    ) -> Result<(), EngineError> {
        let output = self
            .replan(ReplanInput {
                plan: report.plan.clone(),
                critique,
                assessment,
                execution: report.execution.clone(),
                recommended_tools: report.recommended_tools.clone(),
                insights: report.insights.clone(),
            })
            .await?;
        report.plan = output.plan;
        report.diffs.push(output.diff);
        Ok(())
    }
}
