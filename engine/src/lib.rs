//! Waypoint Engine Library
//!
//! Plan control plane: validates, executes, assesses and revises multi-step
//! tool plans. Used by the `waypoint` binary and the integration tests.

/// Configuration management module
pub mod config;

/// Reasoner providers and routing
pub mod reasoner;

/// Tool Runner clients
pub mod tools;

/// Plan model and the conductor stages
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
