//! Dependency Scheduler
//!
//! Executes a plan in waves. A wave is every pending step whose dependencies
//! have succeeded; its steps run concurrently (bounded by `max_parallel`)
//! against a snapshot of the results so far, and the scheduler alone applies
//! their outcomes to the plan afterwards.
//!
//! State machine: `NotStarted -> Running -> Completed | PausedForFeedback | Deadlocked`.
//! A paused run keeps every result and can be resumed with answers.

use crate::conductor::context::IdGenerator;
use crate::conductor::coordination::Coordinator;
use crate::conductor::placeholder::PlaceholderPolicy;
use crate::conductor::recovery::{classify_error, fallback_decision, FailureContext, RecoveryAdvisor, RecoveryDecision};
use crate::conductor::types::{
    Adaptation, Critique, ErrorKind, ExecutionError, ExecutionResult, ExecutionState,
    FollowUpQuestion, Plan, PlanExecutionResult, PlanUpdate, QuestionPriority, Recommendation,
    Step, StepId, StepStatus,
};
use crate::conductor::Stage;
use crate::config::ExecutorConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sdk::validation::is_blank;
use sdk::{errors::EngineError, Arguments, ToolCatalog, ToolRunner};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub struct ExecutionInput {
    pub plan: Plan,
    pub critique: Critique,
    /// Answers keyed by question id, applied when resuming
    pub answers: BTreeMap<String, String>,
    /// Paused run to continue from
    pub previous: Option<PlanExecutionResult>,
}

impl ExecutionInput {
    pub fn new(plan: Plan, critique: Critique) -> Self {
        Self {
            plan,
            critique,
            answers: BTreeMap::new(),
            previous: None,
        }
    }

    pub fn resuming(mut self, previous: PlanExecutionResult, answers: BTreeMap<String, String>) -> Self {
        self.previous = Some(previous);
        self.answers = answers;
        self
    }
}

enum Terminal {
    Succeeded(Value),
    Failed { message: String, kind: ErrorKind },
    AskUser(FollowUpQuestion),
}

/// Everything one step produced in a wave, applied by the scheduler afterwards
struct StepOutcome {
    step_id: StepId,
    records: Vec<ExecutionResult>,
    update: Option<PlanUpdate>,
    adaptations: Vec<Adaptation>,
    terminal: Terminal,
}

pub struct Scheduler {
    runner: Arc<dyn ToolRunner>,
    coordinator: Coordinator,
    recovery: RecoveryAdvisor,
    policy: Arc<dyn PlaceholderPolicy>,
    ids: Arc<IdGenerator>,
    config: ExecutorConfig,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn ToolRunner>,
        coordinator: Coordinator,
        recovery: RecoveryAdvisor,
        policy: Arc<dyn PlaceholderPolicy>,
        ids: Arc<IdGenerator>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runner,
            coordinator,
            recovery,
            policy,
            ids,
            config,
        }
    }

    /// Run `plan` from the start.
    pub async fn execute(
        &self,
        plan: &mut Plan,
        critique: &Critique,
    ) -> Result<PlanExecutionResult, EngineError> {
        let mut result = PlanExecutionResult::new(&plan.id);
        self.drive(plan, critique, &mut result).await?;
        Ok(result)
    }

    /// Continue a paused run, writing each answer into the parameter its
    /// question targets.
    pub async fn resume(
        &self,
        plan: &mut Plan,
        critique: &Critique,
        mut previous: PlanExecutionResult,
        answers: &BTreeMap<String, String>,
    ) -> Result<PlanExecutionResult, EngineError> {
        if previous.plan_id != plan.id {
            return Err(EngineError::InvalidPlan(format!(
                "execution state belongs to plan {}, not {}",
                previous.plan_id, plan.id
            )));
        }

        for (question_id, answer) in answers {
            let index = match previous.questions_asked.iter().position(|q| &q.id == question_id) {
                Some(index) => index,
                None => {
                    let asked = critique
                        .follow_up_questions
                        .iter()
                        .find(|q| &q.id == question_id)
                        .cloned()
                        .ok_or_else(|| EngineError::UnknownQuestion(question_id.clone()))?;
                    previous.questions_asked.push(asked);
                    previous.questions_asked.len() - 1
                }
            };
            let question = &mut previous.questions_asked[index];
            question.answer = Some(answer.clone());

            let (Some(step_id), Some(parameter)) = (&question.step_id, &question.parameter) else {
                continue;
            };
            if let Some(step) = plan.step_mut(step_id) {
                let before = step.parameters.clone();
                step.parameters.insert(parameter.clone(), answer_value(answer));
                previous.plan_updates.push(PlanUpdate {
                    step_id: step_id.clone(),
                    before,
                    after: step.parameters.clone(),
                    reason: format!("answer to {}", question_id),
                    at: Utc::now(),
                });
            }
        }

        for step in &mut plan.steps {
            if previous.partial_results.contains_key(&step.id) {
                step.status = StepStatus::Succeeded;
            } else if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }

        info!(plan_id = %plan.id, answers = answers.len(), "Resuming execution");
        self.drive(plan, critique, &mut previous).await?;
        Ok(previous)
    }

    async fn drive(
        &self,
        plan: &mut Plan,
        critique: &Critique,
        result: &mut PlanExecutionResult,
    ) -> Result<(), EngineError> {
        if critique.recommendation == Recommendation::Reject {
            return Err(EngineError::PlanRejected(format!(
                "plan {} (version {}) was rejected by its critique",
                plan.id, plan.version
            )));
        }

        result.state = ExecutionState::Running;
        let catalog = match self.runner.catalog().await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, "Catalog unavailable, recovery cannot suggest other tools");
                ToolCatalog::default()
            }
        };
        let dependencies = self.effective_dependencies(plan);

        loop {
            self.cascade_skips(plan, &dependencies, result);

            let wave = self.ready_steps(plan, &dependencies);
            if wave.is_empty() {
                let stuck: Vec<StepId> = plan
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Pending)
                    .map(|s| s.id.clone())
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                let deadlock = EngineError::Deadlock(stuck);
                error!(plan_id = %plan.id, error = %deadlock, "No step can run");
                result.errors.push(ExecutionError {
                    step_id: None,
                    message: deadlock.to_string(),
                    kind: None,
                });
                result.state = ExecutionState::Deadlocked;
                result.overall_success = false;
                return Ok(());
            }

            let blocking = self.blocking_questions(&wave, critique, result);
            if !blocking.is_empty() {
                for question in blocking {
                    if !result.questions_asked.iter().any(|q| q.id == question.id) {
                        result.questions_asked.push(question);
                    }
                }
                info!(plan_id = %plan.id, pending = result.pending_questions().count(), "Paused for feedback");
                result.state = ExecutionState::PausedForFeedback;
                return Ok(());
            }

            debug!(
                plan_id = %plan.id,
                steps = ?wave.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
                "Running wave"
            );
            for step in &wave {
                if let Some(s) = plan.step_mut(&step.id) {
                    s.status = StepStatus::Running;
                }
            }

            let snapshot = plan.clone();
            let results_so_far = result.partial_results.clone();
            let runs: Vec<_> = wave
                .iter()
                .map(|step| self.run_step(step, &snapshot, &results_so_far, critique, &catalog))
                .collect();
            let mut outcomes: Vec<StepOutcome> = stream::iter(runs)
                .buffer_unordered(self.config.max_parallel.max(1))
                .collect()
                .await;
            outcomes.sort_by_key(|o| snapshot.step(&o.step_id).map(|s| s.order).unwrap_or(u32::MAX));

            let mut pause = false;
            for outcome in outcomes {
                pause |= apply_outcome(plan, result, outcome);
            }
            if pause {
                info!(plan_id = %plan.id, "Paused for feedback after step failure");
                result.state = ExecutionState::PausedForFeedback;
                return Ok(());
            }
        }

        result.overall_success = plan.steps.iter().all(|s| s.status == StepStatus::Succeeded)
            && result.errors.is_empty();
        result.state = ExecutionState::Completed;
        info!(
            plan_id = %plan.id,
            success = result.overall_success,
            results = result.execution_results.len(),
            "Execution completed"
        );
        Ok(())
    }

    /// Declared dependencies plus the steps a back-reference points at
    fn effective_dependencies(&self, plan: &Plan) -> HashMap<StepId, BTreeSet<StepId>> {
        plan.steps
            .iter()
            .map(|step| {
                let mut deps = step.dependencies.clone();
                for value in step.parameters.values() {
                    if let Some(source) = self
                        .policy
                        .back_reference(value)
                        .and_then(|r| r.resolve(plan).map(|s| s.id.clone()))
                        .filter(|id| id != &step.id)
                    {
                        deps.insert(source);
                    }
                }
                (step.id.clone(), deps)
            })
            .collect()
    }

    fn satisfies(&self, status: Option<StepStatus>) -> bool {
        match status {
            Some(StepStatus::Succeeded) => true,
            Some(StepStatus::Skipped) => self.config.skipped_satisfies_dependencies,
            _ => false,
        }
    }

    fn ready_steps(&self, plan: &Plan, dependencies: &HashMap<StepId, BTreeSet<StepId>>) -> Vec<Step> {
        let status: HashMap<&str, StepStatus> =
            plan.steps.iter().map(|s| (s.id.as_str(), s.status)).collect();
        let mut wave: Vec<Step> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                dependencies
                    .get(&s.id)
                    .map_or(true, |deps| deps.iter().all(|d| self.satisfies(status.get(d.as_str()).copied())))
            })
            .cloned()
            .collect();
        wave.sort_by_key(|s| s.order);
        wave
    }

    /// Skip pending steps behind a failed (or skipped) dependency, transitively
    fn cascade_skips(
        &self,
        plan: &mut Plan,
        dependencies: &HashMap<StepId, BTreeSet<StepId>>,
        result: &mut PlanExecutionResult,
    ) {
        loop {
            let status: HashMap<StepId, StepStatus> =
                plan.steps.iter().map(|s| (s.id.clone(), s.status)).collect();
            let mut changed = false;

            for step in plan.steps.iter_mut().filter(|s| s.status == StepStatus::Pending) {
                let blocker = dependencies.get(&step.id).and_then(|deps| {
                    deps.iter().find(|d| match status.get(*d) {
                        Some(StepStatus::Failed) => true,
                        Some(StepStatus::Skipped) => !self.config.skipped_satisfies_dependencies,
                        _ => false,
                    })
                });
                if let Some(blocker) = blocker {
                    info!(step_id = %step.id, dependency = %blocker, "Skipping step");
                    result.errors.push(ExecutionError {
                        step_id: Some(step.id.clone()),
                        message: format!("skipped because dependency '{}' did not succeed", blocker),
                        kind: None,
                    });
                    step.status = StepStatus::Skipped;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Questions that must be answered before `wave` may run
    fn blocking_questions(
        &self,
        wave: &[Step],
        critique: &Critique,
        result: &PlanExecutionResult,
    ) -> Vec<FollowUpQuestion> {
        let answered = |id: &str| {
            result
                .questions_asked
                .iter()
                .any(|q| q.id == id && q.is_answered())
        };

        let mut blocking: Vec<FollowUpQuestion> = critique
            .follow_up_questions
            .iter()
            .filter(|q| q.priority == QuestionPriority::High && !q.is_answered() && !answered(&q.id))
            .cloned()
            .collect();

        let flagged = critique.high_severity_steps();
        for step in wave.iter().filter(|s| flagged.contains(&s.id)) {
            let about_step = |q: &&FollowUpQuestion| q.step_id.as_deref() == Some(step.id.as_str());
            let cleared = result
                .questions_asked
                .iter()
                .chain(critique.follow_up_questions.iter())
                .filter(about_step)
                .any(|q| q.is_answered() || answered(&q.id));
            if cleared || blocking.iter().any(|q| about_step(&q)) {
                continue;
            }

            let existing = critique
                .follow_up_questions
                .iter()
                .chain(result.questions_asked.iter())
                .find(about_step)
                .cloned();
            let question = existing.unwrap_or_else(|| {
                let concerns: Vec<&str> = critique
                    .issues
                    .iter()
                    .filter(|i| i.affected_steps.contains(&step.id))
                    .map(|i| i.description.as_str())
                    .collect();
                FollowUpQuestion {
                    id: self.ids.next("q"),
                    question: format!(
                        "Step '{}' ({}) was flagged before running: {}. How should it proceed?",
                        step.id,
                        step.action,
                        concerns.join("; ")
                    ),
                    priority: QuestionPriority::High,
                    step_id: Some(step.id.clone()),
                    parameter: None,
                    answer: None,
                }
            });
            blocking.push(question);
        }

        blocking
    }

    async fn run_step(
        &self,
        step: &Step,
        plan: &Plan,
        partial_results: &BTreeMap<StepId, Value>,
        critique: &Critique,
        catalog: &ToolCatalog,
    ) -> StepOutcome {
        let mut outcome = StepOutcome {
            step_id: step.id.clone(),
            records: Vec::new(),
            update: None,
            adaptations: Vec::new(),
            terminal: Terminal::Failed {
                message: String::new(),
                kind: ErrorKind::ToolError,
            },
        };

        let mut action = step.action.clone();
        let mut rounds = 0u32;
        let mut parameters = loop {
            let failure = match self
                .coordinator
                .coordinate(step, plan, partial_results, critique)
                .await
            {
                Ok(coordination) => {
                    outcome.update = coordination.update;
                    break coordination.parameters;
                }
                Err(failure) => failure,
            };

            let message = failure.to_string();
            warn!(step_id = %step.id, error = %message, "Coordination failed");
            outcome.records.push(ExecutionResult {
                step_id: step.id.clone(),
                success: false,
                result: None,
                error: Some(message.clone()),
                error_kind: Some(ErrorKind::CoordinationError),
                retries: 0,
                duration_ms: 0,
                tool_called: action.clone(),
                parameters_used: step.parameters.clone(),
            });
            let context = FailureContext {
                step,
                action: &action,
                parameters: &step.parameters,
                error: &message,
                kind: ErrorKind::CoordinationError,
                attempts: 0,
                partial_results,
            };
            let decision = if rounds >= self.config.max_recovery_attempts {
                fallback_decision(&context)
            } else {
                self.recovery.decide(&context, catalog).await
            };
            rounds += 1;

            match decision {
                RecoveryDecision::Retry => continue,
                RecoveryDecision::Adapt {
                    new_action,
                    parameters: adapted,
                    reason,
                } => {
                    outcome.adaptations.push(Adaptation {
                        step_id: step.id.clone(),
                        original_action: action.clone(),
                        new_action: new_action.clone(),
                        reason,
                    });
                    action = new_action;
                    break if adapted.is_empty() {
                        step.parameters.clone()
                    } else {
                        adapted
                    };
                }
                RecoveryDecision::AskUser { question } => {
                    outcome.terminal = Terminal::AskUser(FollowUpQuestion {
                        id: self.ids.next("q"),
                        question,
                        priority: QuestionPriority::High,
                        step_id: Some(step.id.clone()),
                        parameter: Some(failure.parameter),
                        answer: None,
                    });
                    return outcome;
                }
                RecoveryDecision::Skip => {
                    outcome.terminal = Terminal::Failed {
                        message,
                        kind: ErrorKind::CoordinationError,
                    };
                    return outcome;
                }
            }
        };

        loop {
            let started = Instant::now();
            let (attempt_result, attempts) = self.invoke_with_retries(&step.id, &action, &parameters).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let message = match attempt_result {
                Ok(value) => {
                    info!(step_id = %step.id, action = %action, attempts, "Step succeeded");
                    outcome.records.push(ExecutionResult {
                        step_id: step.id.clone(),
                        success: true,
                        result: Some(value.clone()),
                        error: None,
                        error_kind: None,
                        retries: attempts,
                        duration_ms,
                        tool_called: action.clone(),
                        parameters_used: parameters.clone(),
                    });
                    outcome.terminal = Terminal::Succeeded(value);
                    return outcome;
                }
                Err(message) => message,
            };

            let kind = classify_error(&message);
            outcome.records.push(ExecutionResult {
                step_id: step.id.clone(),
                success: false,
                result: None,
                error: Some(message.clone()),
                error_kind: Some(kind),
                retries: attempts,
                duration_ms,
                tool_called: action.clone(),
                parameters_used: parameters.clone(),
            });

            let context = FailureContext {
                step,
                action: &action,
                parameters: &parameters,
                error: &message,
                kind,
                attempts,
                partial_results,
            };
            let decision = if rounds >= self.config.max_recovery_attempts {
                fallback_decision(&context)
            } else {
                self.recovery.decide(&context, catalog).await
            };
            rounds += 1;

            match decision {
                RecoveryDecision::Retry => continue,
                RecoveryDecision::Adapt {
                    new_action,
                    parameters: adapted,
                    reason,
                } => {
                    outcome.adaptations.push(Adaptation {
                        step_id: step.id.clone(),
                        original_action: action.clone(),
                        new_action: new_action.clone(),
                        reason,
                    });
                    action = new_action;
                    if !adapted.is_empty() {
                        parameters = adapted;
                    }
                }
                RecoveryDecision::AskUser { question } => {
                    outcome.terminal = Terminal::AskUser(FollowUpQuestion {
                        id: self.ids.next("q"),
                        question,
                        priority: QuestionPriority::High,
                        step_id: Some(step.id.clone()),
                        parameter: missing_parameter(catalog, &action, &parameters, &message),
                        answer: None,
                    });
                    return outcome;
                }
                RecoveryDecision::Skip => {
                    outcome.terminal = Terminal::Failed { message, kind };
                    return outcome;
                }
            }
        }
    }

    /// Call the tool up to `max_retries` times with a fixed delay in between.
    /// Returns the outcome and the number of attempts made.
    async fn invoke_with_retries(
        &self,
        step_id: &str,
        action: &str,
        parameters: &Arguments,
    ) -> (Result<Value, String>, u32) {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.runner.call_tool(action, parameters).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) => {
                    warn!(step_id, action, attempt, error = %e, "Tool call failed");
                    last_error = e.to_string();
                    if matches!(e, EngineError::ToolNotFound(_)) {
                        return (Err(last_error), attempt);
                    }
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }

        (Err(last_error), max_attempts)
    }
}

/// Apply one step's outcome to the plan and the run. Returns true when the
/// run has to pause for the user.
fn apply_outcome(plan: &mut Plan, result: &mut PlanExecutionResult, outcome: StepOutcome) -> bool {
    let Some(step) = plan.step_mut(&outcome.step_id) else {
        return false;
    };
    if let Some(update) = outcome.update {
        step.parameters = update.after.clone();
        result.plan_updates.push(update);
    }
    result.execution_results.extend(outcome.records);
    result.adaptations.extend(outcome.adaptations);

    match outcome.terminal {
        Terminal::Succeeded(value) => {
            step.status = StepStatus::Succeeded;
            result
                .errors
                .retain(|e| e.step_id.as_deref() != Some(outcome.step_id.as_str()));
            result.partial_results.insert(outcome.step_id, value);
            false
        }
        Terminal::Failed { message, kind } => {
            step.status = StepStatus::Failed;
            result.errors.push(ExecutionError {
                step_id: Some(outcome.step_id),
                message,
                kind: Some(kind),
            });
            false
        }
        Terminal::AskUser(question) => {
            step.status = StepStatus::Pending;
            result.questions_asked.push(question);
            true
        }
    }
}

/// An answer is used as JSON when it parses, otherwise as a string
pub(crate) fn answer_value(answer: &str) -> Value {
    let trimmed = answer.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// The required parameter an error message names, if it is absent
fn missing_parameter(catalog: &ToolCatalog, action: &str, parameters: &Arguments, message: &str) -> Option<String> {
    let required = catalog
        .get_tool(action)
        .map(|t| &t.input_schema.required)
        .or_else(|| catalog.get_workflow(action).map(|w| &w.input_schema.required))?;
    required
        .iter()
        .filter(|name| parameters.get(*name).map_or(true, is_blank))
        .find(|name| message.contains(name.as_str()))
        .cloned()
}

#[async_trait]
impl Stage for Scheduler {
    type Input = ExecutionInput;
    type Output = PlanExecutionResult;

    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn prepare(&self, input: &mut ExecutionInput) -> Result<(), EngineError> {
        if input.critique.recommendation == Recommendation::Reject {
            return Err(EngineError::PlanRejected(format!(
                "plan {} (version {}) was rejected by its critique",
                input.plan.id, input.plan.version
            )));
        }
        Ok(())
    }

    async fn run(&self, input: &mut ExecutionInput) -> Result<PlanExecutionResult, EngineError> {
        match input.previous.take() {
            Some(previous) => {
                self.resume(&mut input.plan, &input.critique, previous, &input.answers)
                    .await
            }
            None => self.execute(&mut input.plan, &input.critique).await,
        }
    }
}
