// Waypoint plan control plane
// Main entry point for the waypoint binary

use clap::Parser;
use waypoint_engine::cli::{Cli, Command};
use waypoint_engine::config::Config;
use waypoint_engine::handlers::{
    handle_assess, handle_diff, handle_execute, handle_replan, handle_run, handle_tools,
    handle_validate, OutputFormat,
};
use waypoint_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config level; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!("Waypoint v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { plan, version, out } => {
            tracing::info!("Validating plan: {}", plan.display());
            handle_validate(&plan, version, out, &config, format).await
        }

        Command::Execute {
            plan,
            critique,
            answers,
            state,
            save,
        } => {
            tracing::info!("Executing plan: {}", plan.display());
            handle_execute(
                &plan,
                critique.as_deref(),
                answers.as_deref(),
                state.as_deref(),
                save,
                &config,
                format,
            )
            .await
        }

        Command::Assess {
            plan,
            critique,
            state,
            reasoning,
        } => {
            tracing::info!("Assessing plan: {}", plan.display());
            handle_assess(&plan, &critique, state.as_deref(), reasoning, &config, format).await
        }

        Command::Replan {
            plan,
            critique,
            assessment,
            state,
            out,
        } => {
            tracing::info!("Replanning: {}", plan.display());
            handle_replan(
                &plan,
                &critique,
                assessment.as_deref(),
                state.as_deref(),
                out,
                &config,
                format,
            )
            .await
        }

        Command::Diff { old, new } => handle_diff(&old, &new, format),

        Command::Run {
            goal,
            resume,
            answers,
            save,
        } => {
            tracing::info!("Starting run");
            handle_run(goal, resume.as_deref(), answers.as_deref(), save, &config, format).await
        }

        Command::Tools => handle_tools(&config, format).await,
    }
}
