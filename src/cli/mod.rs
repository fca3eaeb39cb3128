//! Command-line interface for keel.

mod commands;
mod output;
mod prompt;
mod watch;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
pub use prompt::{PromptApproval, ask_cancellable, confirm_cancellable};
pub use watch::WatchInput;
