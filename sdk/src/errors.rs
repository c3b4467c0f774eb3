//! Error types and handling
//!
//! This module provides the error types used throughout the Waypoint engine.
//! All errors implement the `WaypointErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Most plan-level problems never surface as errors: missing parameters become
//! validation findings and failing tool calls become execution results. What is
//! left here is the small set of conditions a caller has to handle directly.

use thiserror::Error;

/// Trait for Waypoint error extensions
///
/// Provides additional context for errors, including user-friendly hints and
/// recoverability information. All engine errors implement this trait.
pub trait WaypointErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors abort the current plan cycle.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: invalid config, no reasoner configured (fatal)
/// - **Reasoner**: model call failures
/// - **Tool Runner**: unknown tools, tool execution failures, transport errors
/// - **Plan**: structurally invalid plans, rejected plans, deadlocked graphs
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, WaypointErrorExt};
///
/// let error = EngineError::ToolNotFound("list_facilities".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::ReasonerNotConfigured;
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No reasoner configured")]
    ReasonerNotConfigured,

    // Reasoner errors
    #[error("Reasoner error: {0}")]
    Reasoner(String),

    #[error("Reasoner call timed out")]
    ReasonerTimeout,

    // Tool runner errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool runner unavailable: {0}")]
    ToolRunnerUnavailable(String),

    // Plan errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Plan deadlocked: steps {0:?} can never run")]
    Deadlock(Vec<String>),

    #[error("Unknown question: {0}")]
    UnknownQuestion(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WaypointErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::ReasonerNotConfigured => {
                "Configure a reasoner provider in the [reasoner] section of config.toml"
            }

            Self::Reasoner(_) => "Reasoner unavailable. Check the provider URL and API key",
            Self::ReasonerTimeout => "Reasoner took too long to respond. Try again",

            Self::ToolNotFound(_) => "The requested tool is not in the tool runner catalog",
            Self::ToolError(_) => "Tool operation failed",
            Self::ToolRunnerUnavailable(_) => "Tool runner unreachable. Check tool_runner.base_url",

            Self::InvalidPlan(_) => "The plan is malformed. Regenerate it or fix the JSON",
            Self::PlanRejected(_) => "The plan was rejected during validation. Replan first",
            Self::Deadlock(_) => "The plan has circular or dangling dependencies",
            Self::UnknownQuestion(_) => "The answer refers to a question that was never asked",

            Self::Serialization(_) => "Malformed JSON input",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::ReasonerNotConfigured | Self::Deadlock(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
