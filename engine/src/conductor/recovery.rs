//! Failure recovery
//!
//! Once a step has used up its attempts, the error is classified and the
//! reasoner chooses what happens next: run it again, ask the user, switch to
//! another tool, or give up on the step.

use crate::conductor::context::ContextAssembler;
use crate::conductor::types::{ErrorKind, Step, StepId};
use crate::reasoner::{generate_structured, GenerationOptions, Reasoner};
use sdk::{Arguments, ToolCatalog};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const RECOVERY_INSTRUCTIONS: &str = "You are the recovery advisor. A plan step failed after \
all retries. Decide what to do next.\n\
Respond with ONLY a JSON object:\n\
{\"decision\": \"retry|ask-user|adapt|skip\", \"question\": \"<for ask-user: what to ask>\", \
\"alternativeTool\": \"<for adapt: a tool from the catalog>\", \
\"parameters\": {<for adapt: parameters for that tool>}, \"reason\": \"...\"}";

/// What to do with a step that failed terminally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum RecoveryDecision {
    Retry,
    AskUser {
        question: String,
    },
    Adapt {
        new_action: String,
        #[serde(default)]
        parameters: Arguments,
        reason: String,
    },
    Skip,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawDecision {
    decision: String,
    question: Option<String>,
    alternative_tool: Option<String>,
    parameters: Arguments,
    reason: Option<String>,
}

/// Everything known about a failure when deciding how to recover
pub struct FailureContext<'a> {
    pub step: &'a Step,
    pub action: &'a str,
    pub parameters: &'a Arguments,
    pub error: &'a str,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub partial_results: &'a BTreeMap<StepId, Value>,
}

/// Classify a tool error message
pub fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(&["missing", "required", "not provided", "undefined", "no value"]) {
        ErrorKind::MissingData
    } else if any(&["invalid", "validation", "must be", "expected", "malformed", "out of range"]) {
        ErrorKind::ValidationError
    } else {
        ErrorKind::ToolError
    }
}

pub struct RecoveryAdvisor {
    reasoner: Arc<dyn Reasoner>,
    assembler: ContextAssembler,
    options: GenerationOptions,
}

impl RecoveryAdvisor {
    pub fn new(reasoner: Arc<dyn Reasoner>, options: GenerationOptions) -> Self {
        Self {
            reasoner,
            assembler: ContextAssembler::default(),
            options,
        }
    }

    /// Ask the reasoner; fall back to a fixed rule when it cannot answer.
    pub async fn decide(&self, failure: &FailureContext<'_>, catalog: &ToolCatalog) -> RecoveryDecision {
        let messages = self.assembler.assemble(
            RECOVERY_INSTRUCTIONS,
            &[
                (
                    "Failed step",
                    format!(
                        "{} ({}): {}\nerror kind: {}\nattempts: {}\nerror: {}",
                        failure.step.id,
                        failure.action,
                        failure.step.description,
                        failure.kind,
                        failure.attempts,
                        failure.error
                    ),
                ),
                (
                    "Parameters used",
                    serde_json::to_string_pretty(failure.parameters).unwrap_or_default(),
                ),
                ("Catalog", catalog.action_names().join(", ")),
                (
                    "Completed steps",
                    failure.partial_results.keys().cloned().collect::<Vec<_>>().join(", "),
                ),
            ],
            "How should this failure be handled?",
        );

        let decision =
            match generate_structured::<RawDecision>(self.reasoner.as_ref(), &messages, &self.options)
                .await
            {
                Ok(raw) => self.interpret(raw, failure, catalog),
                Err(e) => {
                    warn!(step_id = %failure.step.id, error = %e, "Recovery advice unavailable");
                    None
                }
            };

        let decision = decision.unwrap_or_else(|| fallback_decision(failure));
        info!(step_id = %failure.step.id, kind = %failure.kind, decision = ?decision, "Recovery decided");
        decision
    }

    fn interpret(
        &self,
        raw: RawDecision,
        failure: &FailureContext<'_>,
        catalog: &ToolCatalog,
    ) -> Option<RecoveryDecision> {
        match raw.decision.trim().to_lowercase().replace('_', "-").as_str() {
            "retry" => Some(RecoveryDecision::Retry),
            "skip" => Some(RecoveryDecision::Skip),
            "ask-user" | "ask" => Some(RecoveryDecision::AskUser {
                question: raw
                    .question
                    .filter(|q| !q.trim().is_empty())
                    .unwrap_or_else(|| default_question(failure)),
            }),
            "adapt" => {
                let tool = raw.alternative_tool?;
                let Some(new_action) = catalog.normalize_action(&tool) else {
                    warn!(step_id = %failure.step.id, tool = %tool, "Suggested tool is not in the catalog");
                    return None;
                };
                Some(RecoveryDecision::Adapt {
                    new_action,
                    parameters: raw.parameters,
                    reason: raw.reason.unwrap_or_default(),
                })
            }
            _ => None,
        }
    }
}

/// Missing data and unresolvable references go to the user; anything else
/// is skipped.
pub fn fallback_decision(failure: &FailureContext<'_>) -> RecoveryDecision {
    match failure.kind {
        ErrorKind::MissingData | ErrorKind::CoordinationError => RecoveryDecision::AskUser {
            question: default_question(failure),
        },
        _ => RecoveryDecision::Skip,
    }
}

/// A question that says what failed, what was tried and where the run stands
pub fn default_question(failure: &FailureContext<'_>) -> String {
    if failure.kind == ErrorKind::CoordinationError {
        return format!(
            "Step '{}' ({}) could not be prepared: {}. What value should it use instead?",
            failure.step.id, failure.action, failure.error
        );
    }
    let tried = serde_json::to_string(failure.parameters).unwrap_or_default();
    let done = if failure.partial_results.is_empty() {
        "no steps have completed yet".to_string()
    } else {
        format!(
            "completed so far: {}",
            failure.partial_results.keys().cloned().collect::<Vec<_>>().join(", ")
        )
    };
    format!(
        "Step '{}' ({}) failed after {} attempt(s) with {}: {}. It was called with {}; {}. \
         What value or instruction should it use?",
        failure.step.id, failure.action, failure.attempts, failure.kind, failure.error, tried, done
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::scripted::ScriptedReasoner;
    use sdk::ToolSpec;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new(
            vec![
                ToolSpec::new("get_facility", "Get"),
                ToolSpec::new("search_facilities", "Search"),
            ],
            vec![],
        )
    }

    fn failure<'a>(
        step: &'a Step,
        parameters: &'a Arguments,
        results: &'a BTreeMap<StepId, Value>,
        error: &'a str,
    ) -> FailureContext<'a> {
        FailureContext {
            step,
            action: &step.action,
            parameters,
            error,
            kind: classify_error(error),
            attempts: 3,
            partial_results: results,
        }
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("facilityId is required"), ErrorKind::MissingData);
        assert_eq!(classify_error("Invalid date format"), ErrorKind::ValidationError);
        assert_eq!(classify_error("upstream returned 503"), ErrorKind::ToolError);
    }

    #[tokio::test]
    async fn test_adapt_to_catalog_tool() {
        let reply = r#"{"decision": "adapt", "alternativeTool": "tools.search_facilities",
            "parameters": {"query": "north"}, "reason": "lookup by name"}"#;
        let advisor = RecoveryAdvisor::new(
            Arc::new(ScriptedReasoner::new().respond("recovery advisor", reply)),
            GenerationOptions::default(),
        );
        let step = Step::new("step-1", 1, "get_facility");
        let (params, results) = (Arguments::new(), BTreeMap::new());

        let decision = advisor
            .decide(&failure(&step, &params, &results, "upstream 500"), &catalog())
            .await;
        match decision {
            RecoveryDecision::Adapt {
                new_action,
                parameters,
                ..
            } => {
                assert_eq!(new_action, "search_facilities");
                assert_eq!(parameters["query"], json!("north"));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adapt_to_unknown_tool_falls_back() {
        let reply = r#"{"decision": "adapt", "alternativeTool": "teleport"}"#;
        let advisor = RecoveryAdvisor::new(
            Arc::new(ScriptedReasoner::new().respond("recovery advisor", reply)),
            GenerationOptions::default(),
        );
        let step = Step::new("step-1", 1, "get_facility");
        let (params, results) = (Arguments::new(), BTreeMap::new());

        let decision = advisor
            .decide(&failure(&step, &params, &results, "upstream 500"), &catalog())
            .await;
        assert_eq!(decision, RecoveryDecision::Skip);
    }

    #[tokio::test]
    async fn test_fallback_asks_user_for_missing_data() {
        let advisor = RecoveryAdvisor::new(
            Arc::new(ScriptedReasoner::new().fail_on("recovery advisor", "offline")),
            GenerationOptions::default(),
        );
        let step = Step::new("step-2", 2, "get_facility");
        let mut params = Arguments::new();
        params.insert("region".to_string(), json!("north"));
        let mut results = BTreeMap::new();
        results.insert("step-1".to_string(), json!([]));

        let decision = advisor
            .decide(
                &failure(&step, &params, &results, "facilityId is required"),
                &catalog(),
            )
            .await;
        let RecoveryDecision::AskUser { question } = decision else {
            panic!("expected a question");
        };
        assert!(question.contains("step-2"));
        assert!(question.contains("facilityId is required"));
        assert!(question.contains("north"));
        assert!(question.contains("step-1"));
    }

    #[test]
    fn test_fallback_asks_user_for_unresolvable_reference() {
        let step = Step::new("step-1", 1, "get_facility");
        let (params, results) = (Arguments::new(), BTreeMap::new());
        let mut context = failure(
            &step,
            &params,
            &results,
            "cannot resolve 'facilityId': step 'step-1' refers to its own result",
        );
        context.kind = ErrorKind::CoordinationError;
        context.attempts = 0;

        let RecoveryDecision::AskUser { question } = fallback_decision(&context) else {
            panic!("expected a question");
        };
        assert!(question.contains("facilityId"));
        assert!(question.contains("step-1"));
    }
}
