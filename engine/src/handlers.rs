//! Command handlers for CLI operations
//!
//! Each handler loads its JSON inputs, builds what it needs from the config
//! (HTTP Tool Runner, reasoner router, conductor) and prints the result as
//! text or JSON. Paused executions are saved as session files that a later
//! `execute --state` or `run --resume` picks up.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::conductor::{
    compute_diff, AssessmentInput, Conductor, Critique, CritiqueHistory, CycleOutcome, CycleReport,
    ExecutionState, FollowUpQuestion, MetaAssessment, Plan, PlanExecutionResult, ReplanInput,
};
use crate::config::Config;
use crate::tools::http::HttpToolRunner;
use sdk::ToolRunner;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// A plan, the critique it ran under and its (possibly paused) execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub plan: Plan,
    pub critique: Critique,
    pub result: PlanExecutionResult,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(value)?;
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Answers file: a JSON object of question id to answer. Non-string answers
/// are kept as their JSON text.
pub fn read_answers(path: &Path) -> Result<BTreeMap<String, String>> {
    let raw: BTreeMap<String, serde_json::Value> = read_json(path)?;
    Ok(raw
        .into_iter()
        .map(|(id, value)| {
            let answer = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (id, answer)
        })
        .collect())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn session_path(config: &Config, explicit: Option<PathBuf>, name: &str) -> PathBuf {
    explicit.unwrap_or_else(|| config.core.state_dir.join(name))
}

fn build_runner(config: &Config) -> Result<Arc<dyn ToolRunner>> {
    let runner = HttpToolRunner::new(&config.tool_runner).context("Failed to create Tool Runner client")?;
    Ok(Arc::new(runner))
}

fn build_conductor(config: &Config) -> Result<Conductor> {
    let runner = build_runner(config)?;
    Conductor::from_config(config, runner).context("Failed to initialize the conductor")
}

fn print_questions<'a>(questions: impl Iterator<Item = &'a FollowUpQuestion>) {
    for q in questions {
        let target = match (&q.step_id, &q.parameter) {
            (Some(step), Some(param)) => format!(" [{}.{}]", step, param),
            (Some(step), None) => format!(" [{}]", step),
            _ => String::new(),
        };
        println!("  {} ({:?}){}: {}", q.id, q.priority, target, q.question);
    }
}

fn print_execution(result: &PlanExecutionResult) {
    println!("State: {:?}", result.state);
    for r in &result.execution_results {
        let mark = if r.success { "✓" } else { "✗" };
        println!(
            "  {} {} ({}) attempts={} {}ms{}",
            mark,
            r.step_id,
            r.tool_called,
            r.retries,
            r.duration_ms,
            r.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
        );
    }
    for e in &result.errors {
        println!("  error {}: {}", e.step_id.as_deref().unwrap_or("plan"), e.message);
    }
    if result.state == ExecutionState::PausedForFeedback {
        println!("Questions:");
        print_questions(result.pending_questions());
    }
    println!(
        "{}",
        if result.overall_success {
            "✓ Plan succeeded"
        } else {
            "✗ Plan did not succeed"
        }
    );
}

/// Critique a plan file
pub async fn handle_validate(
    plan_path: &Path,
    version: u32,
    out: Option<PathBuf>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let mut plan: Plan = read_json(plan_path)?;
    let conductor = build_conductor(config)?;
    let outcome = conductor.critique(&mut plan, version).await?;

    if let Some(out) = &out {
        write_json(out, &plan)?;
    }

    match format {
        OutputFormat::Json => print_json(&json!({
            "critique": outcome.critique,
            "plan": plan,
        })),
        OutputFormat::Text => {
            let c = &outcome.critique;
            println!("Recommendation: {:?}", c.recommendation);
            println!(
                "Scores: overall {:.2}, feasibility {:.2}, correctness {:.2}, efficiency {:.2}, safety {:.2}",
                c.overall_score, c.feasibility_score, c.correctness_score, c.efficiency_score, c.safety_score
            );
            println!("Validation iterations: {}", outcome.report.iterations);
            for issue in &c.issues {
                println!(
                    "  [{:?}] {:?}: {} {:?}",
                    issue.severity, issue.category, issue.description, issue.affected_steps
                );
            }
            if !c.follow_up_questions.is_empty() {
                println!("Questions:");
                print_questions(c.follow_up_questions.iter());
            }
            Ok(())
        }
    }
}

/// Execute a plan, or resume a saved session with answers
pub async fn handle_execute(
    plan_path: &Path,
    critique_path: Option<&Path>,
    answers_path: Option<&Path>,
    state_path: Option<&Path>,
    save: Option<PathBuf>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let conductor = build_conductor(config)?;

    let session = match state_path {
        Some(state_path) => {
            let saved: Session = read_json(state_path)?;
            let answers = match answers_path {
                Some(path) => read_answers(path)?,
                None => BTreeMap::new(),
            };
            let mut plan = saved.plan;
            let result = conductor
                .resume_execution(&mut plan, &saved.critique, saved.result, answers)
                .await?;
            Session {
                plan,
                critique: saved.critique,
                result,
            }
        }
        None => {
            let mut plan: Plan = read_json(plan_path)?;
            let critique = match critique_path {
                Some(path) => read_json(path)?,
                None => conductor.critique(&mut plan, 1).await?.critique,
            };
            let result = conductor.execute(&mut plan, &critique).await?;
            Session {
                plan,
                critique,
                result,
            }
        }
    };

    let path = session_path(config, save, "session.json");
    write_json(&path, &session)?;
    tracing::info!(path = %path.display(), "Session saved");

    match format {
        OutputFormat::Json => print_json(&session),
        OutputFormat::Text => {
            print_execution(&session.result);
            if session.result.state == ExecutionState::PausedForFeedback {
                println!(
                    "Resume with: waypoint execute {} --state {} --answers <answers.json>",
                    plan_path.display(),
                    path.display()
                );
            }
            Ok(())
        }
    }
}

/// Assess a plan with its critique and, optionally, its execution
pub async fn handle_assess(
    plan_path: &Path,
    critique_path: &Path,
    state_path: Option<&Path>,
    reasoning: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let plan: Plan = read_json(plan_path)?;
    let critique: Critique = read_json(critique_path)?;
    let execution = match state_path {
        Some(path) => Some(read_json::<Session>(path)?.result),
        None => None,
    };
    let mut history = CritiqueHistory::new();
    history.push(critique.clone());

    let conductor = build_conductor(config)?;
    let assessment = conductor
        .assess(AssessmentInput {
            reasoning,
            plan,
            critique,
            history,
            execution,
            context: Default::default(),
        })
        .await?;

    match format {
        OutputFormat::Json => print_json(&assessment),
        OutputFormat::Text => {
            let q = &assessment.reasoning_quality;
            println!(
                "Quality: overall {:.2} (logic {:.2}, completeness {:.2}, alignment {:.2}), pass {}",
                q.overall, q.logic, q.completeness, q.alignment, assessment.pass
            );
            println!("Replan: {}", if assessment.should_replan { "yes" } else { "no" });
            if !assessment.replan_strategy.is_empty() {
                println!("Strategy: {}", assessment.replan_strategy);
            }
            for d in &assessment.orchestrator_directives {
                println!("  {:?} {}: {}", d.action, d.target, d.detail);
            }
            Ok(())
        }
    }
}

/// Produce the next plan version
pub async fn handle_replan(
    plan_path: &Path,
    critique_path: &Path,
    assessment_path: Option<&Path>,
    state_path: Option<&Path>,
    out: Option<PathBuf>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let plan: Plan = read_json(plan_path)?;
    let critique: Critique = read_json(critique_path)?;
    let assessment: Option<MetaAssessment> = match assessment_path {
        Some(path) => Some(read_json(path)?),
        None => None,
    };
    let execution = match state_path {
        Some(path) => Some(read_json::<Session>(path)?.result),
        None => None,
    };

    let conductor = build_conductor(config)?;
    let mut input = ReplanInput::new(plan, critique);
    input.assessment = assessment;
    input.execution = execution;
    let output = conductor.replan(input).await?;

    if let Some(out) = &out {
        write_json(out, &output.plan)?;
    }

    match format {
        OutputFormat::Json => print_json(&json!({
            "plan": output.plan,
            "diff": output.diff,
        })),
        OutputFormat::Text => {
            println!("Plan {} version {}", output.plan.id, output.plan.version);
            for step in &output.plan.steps {
                println!("  {}. {} {} {}", step.order, step.id, step.action, step.description);
            }
            print_diff_text(&output.diff);
            Ok(())
        }
    }
}

fn print_diff_text(diff: &crate::conductor::ReplanDiff) {
    println!("Diff v{} -> v{}:", diff.from_version, diff.to_version);
    println!("  added:    {}", diff.added_steps.join(", "));
    println!("  removed:  {}", diff.removed_steps.join(", "));
    println!("  modified: {}", diff.modified_steps.join(", "));
}

/// Compare two plan files
pub fn handle_diff(old_path: &Path, new_path: &Path, format: OutputFormat) -> Result<()> {
    let old: Plan = read_json(old_path)?;
    let new: Plan = read_json(new_path)?;
    let diff = compute_diff(&old, &new);
    match format {
        OutputFormat::Json => print_json(&diff),
        OutputFormat::Text => {
            print_diff_text(&diff);
            Ok(())
        }
    }
}

/// Run the full cycle for a goal, or resume a saved run
pub async fn handle_run(
    goal: Option<String>,
    resume: Option<&Path>,
    answers_path: Option<&Path>,
    save: Option<PathBuf>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let conductor = build_conductor(config)?;

    let report = match (resume, goal) {
        (Some(path), _) => {
            let saved: CycleReport = read_json(path)?;
            let answers = match answers_path {
                Some(path) => read_answers(path)?,
                None => BTreeMap::new(),
            };
            conductor.resume(saved, answers).await?
        }
        (None, Some(goal)) => {
            if let OutputFormat::Text = format {
                println!("Goal: {}", goal);
            }
            conductor.run_goal(&goal).await?
        }
        (None, None) => anyhow::bail!("either a goal or --resume is required"),
    };

    let path = session_path(config, save, "run.json");
    write_json(&path, &report)?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Text => {
            println!(
                "Outcome: {:?} after {} cycle(s), plan version {}",
                report.outcome, report.cycles, report.plan.version
            );
            if let Some(execution) = &report.execution {
                print_execution(execution);
            }
            for diff in &report.diffs {
                print_diff_text(diff);
            }
            if report.outcome == CycleOutcome::AwaitingInput {
                println!(
                    "Resume with: waypoint run --resume {} --answers <answers.json>",
                    path.display()
                );
            }
            Ok(())
        }
    }
}

/// List the catalog
pub async fn handle_tools(config: &Config, format: OutputFormat) -> Result<()> {
    let runner = build_runner(config)?;
    let catalog = runner
        .catalog()
        .await
        .context("Failed to fetch the tool catalog")?;

    match format {
        OutputFormat::Json => print_json(&catalog),
        OutputFormat::Text => {
            println!("Tools ({}):", catalog.tools.len());
            for tool in &catalog.tools {
                println!("  {} - {}", tool.name, tool.description);
                if !tool.input_schema.required.is_empty() {
                    println!("      required: {}", tool.input_schema.required.join(", "));
                }
            }
            println!("Workflows ({}):", catalog.workflows.len());
            for workflow in &catalog.workflows {
                println!("  {} - {}", workflow.name, workflow.description);
            }
            Ok(())
        }
    }
}
