//! Change plan types.
//!
//! A [`ChangePlan`] is transient: it is computed at the start of a cycle,
//! shown to an operator or approval gate, handed to the executor, and then
//! dropped. Only the resulting snapshot is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{InputValue, UnresolvedReference, resolve_input_map};

/// An ordered set of per-module actions for one environment.
#[derive(Debug, Clone, Serialize)]
pub struct ChangePlan {
    /// Environment the plan targets.
    pub environment: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Hash of the configuration the plan was computed from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    /// Actions in execution order: creates and updates in dependency order,
    /// then deletes in reverse dependency order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Module identifier.
    pub module: String,
    /// Module kind, selects the provisioner.
    pub kind: String,
    /// What will happen to the module.
    pub action: ActionType,
    /// Fingerprint recorded by the last apply.
    pub prior_fingerprint: Option<String>,
    /// Fingerprint of the resolved desired inputs. `None` when an input
    /// depends on an output that will only be known at apply time.
    pub desired_fingerprint: Option<String>,
    /// Desired inputs, with output references left unresolved.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputValue>,
    /// Effective dependencies.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Declared outputs (for deletes, the outputs being destroyed).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Why the action was chosen.
    pub reason: String,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// No prior state: create the module.
    Create,
    /// Prior state differs or a dependency changed: update in place.
    Update,
    /// In state but no longer desired.
    Delete,
    /// Up to date.
    Noop,
}

impl ChangePlan {
    /// Creates a plan from ordered actions.
    #[must_use]
    pub fn new(environment: &str, actions: Vec<PlannedAction>) -> Self {
        Self {
            environment: environment.to_string(),
            created_at: Utc::now(),
            config_hash: None,
            actions,
        }
    }

    /// Records the configuration hash the plan was computed from.
    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Returns true if any action is not a no-op.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action != ActionType::Noop)
    }

    /// Actions that invoke a provisioner, in order.
    pub fn steps(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.action != ActionType::Noop)
    }

    /// Names of modules the plan changes.
    #[must_use]
    pub fn changed_modules(&self) -> Vec<String> {
        self.steps().map(|a| a.module.clone()).collect()
    }

    /// Looks up the action for a module.
    #[must_use]
    pub fn action(&self, module: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.module == module)
    }

    /// Number of actions of a given type.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action == action).count()
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if the plan has no actions at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// One-line summary, e.g. `2 to create, 1 to update, 0 to delete`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.count(ActionType::Create),
            self.count(ActionType::Update),
            self.count(ActionType::Delete),
            self.count(ActionType::Noop),
        )
    }
}

impl PlannedAction {
    /// Resolves the action's inputs through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` cannot satisfy.
    pub fn resolve_inputs<F>(&self, lookup: F) -> Result<BTreeMap<String, Value>, UnresolvedReference>
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        resolve_input_map(&self.inputs, lookup)
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ActionType::Create => format!("Create {} '{}'", self.kind, self.module),
            ActionType::Update => format!("Update {} '{}'", self.kind, self.module),
            ActionType::Delete => format!("Delete {} '{}'", self.kind, self.module),
            ActionType::Noop => format!("No change for '{}'", self.module),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.module)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required for '{}'", self.environment);
        }

        writeln!(f, "Change plan for '{}' ({}):", self.environment, self.summary())?;
        for (i, action) in self.steps().enumerate() {
            writeln!(f, "  {}. {action}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(module: &str, action: ActionType) -> PlannedAction {
        PlannedAction {
            module: module.to_string(),
            kind: String::from("network"),
            action,
            prior_fingerprint: None,
            desired_fingerprint: None,
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
            reason: String::new(),
        }
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = ChangePlan::new("dev", vec![action("net", ActionType::Noop)]);
        assert!(!plan.has_changes());
        assert_eq!(plan.steps().count(), 0);
        assert_eq!(plan.to_string(), "No changes required for 'dev'");
    }

    #[test]
    fn test_steps_skip_noops() {
        let plan = ChangePlan::new(
            "dev",
            vec![
                action("net", ActionType::Noop),
                action("cluster", ActionType::Update),
                action("old", ActionType::Delete),
            ],
        );
        assert!(plan.has_changes());
        assert_eq!(plan.changed_modules(), vec!["cluster", "old"]);
        assert_eq!(plan.summary(), "0 to create, 1 to update, 1 to delete, 1 unchanged");
        assert!(plan.to_string().contains("  1. update cluster"));
    }

    #[test]
    fn test_action_type_serializes_lowercase() {
        let json = serde_json::to_value(ActionType::Noop).expect("serializes");
        assert_eq!(json, serde_json::json!("noop"));
    }
}
