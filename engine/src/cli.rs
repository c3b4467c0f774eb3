//! CLI interface for Waypoint
//!
//! Defines the commands and global flags with clap's derive API. Plans,
//! critiques, execution results and sessions are read from and written to
//! JSON files.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Waypoint plan control plane
///
/// Validates, executes, assesses and revises multi-step tool plans.
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate and critique a plan
    Validate {
        /// Plan JSON file
        plan: PathBuf,

        /// Critique version number
        #[arg(long, default_value = "1")]
        version: u32,

        /// Write the plan with resolved parameters here
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Execute a plan, or resume a paused execution
    Execute {
        /// Plan JSON file
        plan: PathBuf,

        /// Critique to execute under (critiqued first when absent)
        #[arg(long, value_name = "PATH")]
        critique: Option<PathBuf>,

        /// Answers to open questions, a JSON object keyed by question id
        #[arg(long, value_name = "PATH", requires = "state")]
        answers: Option<PathBuf>,

        /// Session written by an earlier paused execution
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,

        /// Where to write the session (defaults to the state directory)
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,
    },

    /// Score a plan and decide whether to replan
    Assess {
        plan: PathBuf,

        #[arg(long, value_name = "PATH")]
        critique: PathBuf,

        /// Session with the execution to take into account
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,

        /// Reasoning that produced the plan
        #[arg(long, default_value = "")]
        reasoning: String,
    },

    /// Produce the next version of a plan
    Replan {
        plan: PathBuf,

        #[arg(long, value_name = "PATH")]
        critique: PathBuf,

        #[arg(long, value_name = "PATH")]
        assessment: Option<PathBuf>,

        /// Session with the execution to take into account
        #[arg(long, value_name = "PATH")]
        state: Option<PathBuf>,

        /// Write the new plan here
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Compare two plan versions
    Diff { old: PathBuf, new: PathBuf },

    /// Plan a goal and run the full cycle
    Run {
        /// The goal to reach
        #[arg(required_unless_present = "resume")]
        goal: Option<String>,

        /// Resume a saved run instead of starting one
        #[arg(long, value_name = "PATH", conflicts_with = "goal", requires = "answers")]
        resume: Option<PathBuf>,

        /// Answers for the resumed run, a JSON object keyed by question id
        #[arg(long, value_name = "PATH")]
        answers: Option<PathBuf>,

        /// Where to write the run report (defaults to the state directory)
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,
    },

    /// List the tools and workflows the Tool Runner offers
    Tools,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["waypoint", "--json", "--log", "debug", "tools"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        assert!(matches!(cli.command, Command::Tools));
    }

    #[test]
    fn test_execute_with_resumption() {
        let cli = Cli::parse_from([
            "waypoint",
            "execute",
            "plan.json",
            "--state",
            "session.json",
            "--answers",
            "answers.json",
        ]);
        let Command::Execute { plan, state, answers, critique, .. } = cli.command else {
            panic!("Expected Execute command");
        };
        assert_eq!(plan, PathBuf::from("plan.json"));
        assert_eq!(state, Some(PathBuf::from("session.json")));
        assert_eq!(answers, Some(PathBuf::from("answers.json")));
        assert!(critique.is_none());
    }

    #[test]
    fn test_answers_require_state() {
        let parsed = Cli::try_parse_from(["waypoint", "execute", "plan.json", "--answers", "a.json"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_run_goal_or_resume() {
        let cli = Cli::parse_from(["waypoint", "run", "inspect the north facility"]);
        let Command::Run { goal, resume, .. } = cli.command else {
            panic!("Expected Run command");
        };
        assert_eq!(goal.as_deref(), Some("inspect the north facility"));
        assert!(resume.is_none());

        let cli = Cli::parse_from(["waypoint", "run", "--resume", "s.json", "--answers", "a.json"]);
        assert!(matches!(cli.command, Command::Run { goal: None, resume: Some(_), .. }));

        assert!(Cli::try_parse_from(["waypoint", "run"]).is_err());
    }

    #[test]
    fn test_diff_command() {
        let cli = Cli::parse_from(["waypoint", "diff", "v1.json", "v2.json"]);
        assert!(matches!(cli.command, Command::Diff { .. }));
    }
}
