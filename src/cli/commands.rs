//! CLI command definitions.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// keel - declarative infrastructure reconciliation.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). Overrides `RUST_LOG`.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log line format.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a starter keel.yaml.
    Init {
        /// Directory to initialize.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing configuration.
        #[arg(short, long)]
        force: bool,
    },

    /// Check the configuration and report every problem.
    Validate {
        /// Also print warnings.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the module dependency order.
    Graph {
        /// Restrict to the modules deployed in this environment.
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Show what an apply would change.
    Plan {
        /// Target environment.
        #[arg(short, long)]
        env: String,
    },

    /// Reconcile an environment with the configuration.
    Apply {
        /// Target environment.
        #[arg(short, long)]
        env: String,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Destroy every module recorded for an environment.
    Destroy {
        /// Target environment.
        #[arg(short, long)]
        env: String,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Run one pipeline cycle as if `branch` had been pushed.
    Trigger {
        /// Pushed branch.
        #[arg(short, long)]
        branch: String,

        /// Pushed commit.
        #[arg(long)]
        commit: String,

        /// Approve the plan without asking.
        #[arg(short, long)]
        yes: bool,
    },

    /// Run pipelines for events read from stdin as JSON lines.
    ///
    /// Each line is an event `{"branch": "...", "commit": "..."}`, an
    /// approval `{"approve": "<env>"}` or a rejection
    /// `{"reject": "<env>", "reason": "..."}`.
    Watch,

    /// Inspect or repair an environment's state.
    State {
        /// Target environment.
        #[arg(short, long)]
        env: String,

        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the committed snapshot and lock holder.
    Show,

    /// Take the lock and leave it held.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Remove a lock left behind by another run.
    Unlock {
        /// Only remove the lock if it has expired.
        #[arg(long, conflicts_with = "force")]
        stale: bool,

        /// Remove the lock even if it is live.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Plain text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from(["keel", "-vv", "apply", "--env", "prod", "--yes"])
            .expect("parses");
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Apply { ref env, yes: true } if env == "prod"));
    }

    #[test]
    fn test_unlock_flags_conflict() {
        let result =
            Cli::try_parse_from(["keel", "state", "--env", "prod", "unlock", "--stale", "--force"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_format_json() {
        let cli = Cli::try_parse_from(["keel", "--log-format", "json", "watch"]).expect("parses");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Watch));
    }
}
