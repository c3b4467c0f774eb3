//! Waypoint SDK
//!
//! Shared library providing traits, types, and utilities for Waypoint components.
//! Tool runner backends depend on this crate without pulling in the engine.

/// Tool catalog types
pub mod catalog;

/// Error types and handling
pub mod errors;

/// Tool runner trait
pub mod tool_runner;

/// Tool call and validation types
pub mod types;

/// Schema-aware parameter validation
pub mod validation;

// Re-export commonly used types
pub use catalog::{InputSchema, ParamSpec, ToolCatalog, ToolSpec, WorkflowTemplate};
pub use errors::{EngineError, WaypointErrorExt};
pub use tool_runner::ToolRunner;
pub use types::{
    Arguments, InferableParam, ParamCategorization, ParamValidation, ResolvableParam,
    ToolCallRequest, ValidationRequest,
};
