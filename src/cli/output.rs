//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{KeelConfig, ValidationResult};
use crate::graph::{ExecutionOrder, ResourceGraph};
use crate::pipeline::{CycleReport, Dispatch};
use crate::planner::{ActionType, AppliedStep, ChangePlan, PartialApplyError};
use crate::reconciler::CycleOutcome;
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    format: OutputFormat,
}

#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Module")]
    module: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[derive(Tabled)]
struct AppliedRow {
    #[tabled(rename = "Module")]
    module: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Took")]
    took: String,
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "Module")]
    module: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Outputs")]
    outputs: String,
    #[tabled(rename = "Applied")]
    applied_at: String,
}

#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Module")]
    module: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

#[derive(Serialize)]
struct GraphJson<'a> {
    order: &'a [String],
    dependencies: Vec<(&'a str, &'a [String])>,
}

#[derive(Serialize)]
struct StateJson<'a> {
    snapshot: &'a StateSnapshot,
    lock: Option<&'a LockInfo>,
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    errors: Vec<String>,
    warnings: &'a [String],
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a change plan.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangePlan) -> String {
        match self.format {
            OutputFormat::Json => pretty(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &ChangePlan) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required for '{}'.\n",
                "✓".green(),
                plan.environment
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for {}", plan.environment.bold());
        if let Some(hash) = &plan.config_hash {
            let _ = writeln!(output, "   Config hash: {}", short(hash));
        }
        output.push('\n');

        let rows: Vec<PlanActionRow> = plan
            .steps()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action),
                module: a.module.clone(),
                kind: a.kind.clone(),
                reason: truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Delete).to_string().red(),
            plan.count(ActionType::Noop)
        );
        output
    }

    /// Formats the result of a completed apply or teardown.
    #[must_use]
    pub fn format_outcome(&self, outcome: &CycleOutcome) -> String {
        match self.format {
            OutputFormat::Json => pretty(outcome),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} {} of '{}' complete",
                    "✓".green(),
                    outcome.operation,
                    outcome.environment
                );
                match outcome.committed_serial {
                    Some(serial) => {
                        let _ = writeln!(output, " (state serial {serial})");
                    }
                    None => output.push('\n'),
                }
                if !outcome.applied.is_empty() {
                    output.push('\n');
                    output.push_str(&Self::applied_table(&outcome.applied));
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats an apply that stopped early.
    #[must_use]
    pub fn format_partial(&self, partial: &PartialApplyError) -> String {
        match self.format {
            OutputFormat::Json => pretty(partial),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Apply to '{}' halted: {}\n",
                    "✗".red(),
                    partial.environment,
                    partial.cause
                );
                if !partial.applied.is_empty() {
                    output.push_str("\nApplied before the halt (recorded in state):\n");
                    output.push_str(&Self::applied_table(&partial.applied));
                    output.push('\n');
                }
                if !partial.remaining.is_empty() {
                    let _ = writeln!(output, "\nNot applied: {}", partial.remaining.join(", "));
                }
                if let Some(err) = &partial.commit_error {
                    let _ = writeln!(
                        output,
                        "\n{} State commit failed, applied steps are NOT recorded: {err}",
                        "⚠".yellow()
                    );
                }
                output
            }
        }
    }

    /// Formats a pipeline cycle report. JSON reports are single lines.
    #[must_use]
    pub fn format_report(&self, report: &CycleReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(report).unwrap_or_default(),
            OutputFormat::Text => {
                let marker = if report.succeeded() {
                    "✓".green()
                } else {
                    "✗".red()
                };
                let path: Vec<String> = report.transitions.iter().map(|t| t.to.to_string()).collect();
                let mut output = format!(
                    "{marker} [{}] {} -> {} ({})",
                    report.environment,
                    report.event,
                    report.state,
                    path.join(" > ")
                );
                if let Some(plan) = &report.plan {
                    let _ = write!(output, "\n   {}", plan.summary());
                }
                if !report.applied.is_empty() {
                    let modules: Vec<&str> = report.applied.iter().map(|s| s.module.as_str()).collect();
                    let _ = write!(output, "\n   applied: {}", modules.join(", "));
                }
                if let Some(error) = &report.error {
                    let _ = write!(output, "\n   error: {error}");
                }
                output
            }
        }
    }

    /// Formats the result of routing an event.
    #[must_use]
    pub fn format_dispatch(&self, dispatch: &Dispatch) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(dispatch).unwrap_or_default(),
            OutputFormat::Text => match dispatch {
                Dispatch::Ignored => format!("{} event ignored, no environment for branch", "-".dimmed()),
                Dispatch::Queued { environment } => format!("queued for '{environment}'"),
                Dispatch::Coalesced {
                    environment,
                    superseded,
                } => format!("queued for '{environment}', replacing {superseded}"),
            },
        }
    }

    /// Formats a committed snapshot and the current lock.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => pretty(&StateJson { snapshot, lock }),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}\n", snapshot.environment.bold());
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Lineage: {}", snapshot.lineage);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                match lock {
                    Some(lock) => {
                        let _ = writeln!(output, "   Lock: {}", Self::lock_line(lock));
                    }
                    None => output.push_str("   Lock: free\n"),
                }

                if snapshot.modules.is_empty() {
                    output.push_str("\n   No modules recorded.\n");
                } else {
                    let rows: Vec<ModuleRow> = snapshot
                        .modules
                        .iter()
                        .map(|(name, m)| ModuleRow {
                            module: name.clone(),
                            kind: m.kind.clone(),
                            fingerprint: short(&m.fingerprint).to_string(),
                            outputs: m.outputs.keys().cloned().collect::<Vec<_>>().join(", "),
                            applied_at: m.applied_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} #{} {} - {} ({})",
                            entry.serial,
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.trigger.as_deref().unwrap_or("manual")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a lock record.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => pretty(lock),
            OutputFormat::Text => format!("Locked: {}", Self::lock_line(lock)),
        }
    }

    fn lock_line(lock: &LockInfo) -> String {
        let expiry = if lock.is_expired() {
            "expired".red().to_string()
        } else {
            format!("{}s left", lock.remaining_secs())
        };
        format!("{} held by {} ({expiry})", lock.lock_id, lock.holder)
    }

    /// Formats a dependency graph in execution order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph, order: &ExecutionOrder) -> String {
        let deps = |m: &str| graph.dependencies(m).unwrap_or_default();
        match self.format {
            OutputFormat::Json => pretty(&GraphJson {
                order: order.as_slice(),
                dependencies: order.iter().map(|m| (m, deps(m))).collect(),
            }),
            OutputFormat::Text => {
                if order.is_empty() {
                    return String::from("No modules.\n");
                }
                let rows: Vec<GraphRow> = order
                    .iter()
                    .enumerate()
                    .map(|(i, m)| GraphRow {
                        index: i + 1,
                        module: m.to_string(),
                        depends_on: deps(m).join(", "),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a validation result with a short configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        config: &KeelConfig,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => pretty(&ValidationJson {
                valid: result.errors.is_empty(),
                errors: result.errors.iter().map(ToString::to_string).collect(),
                warnings: &result.warnings,
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.errors.is_empty() {
                    let _ = writeln!(output, "{} Configuration is valid.", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has errors:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Modules: {}", config.modules.len());
                let _ = writeln!(
                    output,
                    "   Environments: {}",
                    config.environment_names().join(", ")
                );
                let _ = writeln!(
                    output,
                    "   Provisioners: {}",
                    config.provisioners.keys().cloned().collect::<Vec<_>>().join(", ")
                );
                output
            }
        }
    }

    fn applied_table(steps: &[AppliedStep]) -> String {
        let rows: Vec<AppliedRow> = steps
            .iter()
            .map(|s| AppliedRow {
                module: s.module.clone(),
                action: Self::format_action_type(s.action),
                fingerprint: s.fingerprint.as_deref().map_or("-", short).to_string(),
                took: format!("{}ms", s.duration_ms),
            })
            .collect();
        Table::new(rows).to_string()
    }

    fn format_action_type(action: ActionType) -> String {
        match action {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::Noop => "no-op".dimmed().to_string(),
        }
    }
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannedAction;
    use std::collections::BTreeMap;

    fn plan() -> ChangePlan {
        let create = PlannedAction {
            module: String::from("network"),
            kind: String::from("net"),
            action: ActionType::Create,
            prior_fingerprint: None,
            desired_fingerprint: Some(String::from("abc")),
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
            outputs: vec![String::from("vpc_id")],
            reason: String::from("New module"),
        };
        ChangePlan::new("staging", vec![create])
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&formatter.format_plan(&plan())).expect("valid json");
        assert_eq!(value["environment"], "staging");
        assert_eq!(value["actions"][0]["action"], "create");
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&ChangePlan::new("prod", Vec::new()));
        assert!(text.contains("No changes required for 'prod'"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
