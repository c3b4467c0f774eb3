//! Conductor System
//!
//! The plan control plane. A goal becomes a plan (planner), the plan is
//! validated and critiqued (critic), executed wave by wave (scheduler), scored
//! (assessor) and, when needed, rewritten into a new version (replanner). The
//! [`Conductor`] runs that cycle.

pub mod assessor;
pub mod context;
pub mod coordination;
pub mod critic;
pub mod memory;
pub mod orchestrator;
pub mod placeholder;
pub mod planner;
pub mod recovery;
pub mod replanner;
pub mod scheduler;
pub mod types;
pub mod validator;

pub use assessor::{AssessmentInput, QualityAssessor};
pub use context::{ContextAssembler, IdGenerator};
pub use coordination::Coordinator;
pub use critic::{Critic, CriticInput, CritiqueOutcome};
pub use memory::{Example, ExampleMemory, StaticExampleMemory};
pub use orchestrator::{Conductor, CycleOutcome, CycleReport};
pub use placeholder::{BackReference, DefaultPlaceholderPolicy, PlaceholderPolicy};
pub use planner::{PlanDraft, PlanRequest, Planner};
pub use recovery::{RecoveryAdvisor, RecoveryDecision};
pub use replanner::{compute_diff, ReplanInput, ReplanOutput, Replanner};
pub use scheduler::{ExecutionInput, Scheduler};
pub use types::*;
pub use validator::{ParameterValidator, ValidationReport};

use async_trait::async_trait;
use sdk::errors::EngineError;
use tracing::warn;

/// Shared shape of the conductor stages.
///
/// `execute` runs `prepare` then `run`; an error from either goes to
/// `handle_error`, which may turn it into a safe default output.
#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn name(&self) -> &'static str;

    /// Check or adjust the input before the main work
    async fn prepare(&self, _input: &mut Self::Input) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run(&self, input: &mut Self::Input) -> Result<Self::Output, EngineError>;

    /// Recover from a failed `prepare` or `run`. Propagates by default.
    async fn handle_error(
        &self,
        _input: &Self::Input,
        error: EngineError,
    ) -> Result<Self::Output, EngineError> {
        Err(error)
    }

    async fn execute(&self, input: &mut Self::Input) -> Result<Self::Output, EngineError> {
        let outcome = match self.prepare(input).await {
            Ok(()) => self.run(input).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(stage = self.name(), error = %e, "Stage failed");
                self.handle_error(input, e).await
            }
        }
    }
}
