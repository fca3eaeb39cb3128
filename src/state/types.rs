//! Persisted state types.
//!
//! A [`StateSnapshot`] is the last-applied picture of one environment: per
//! module the outputs it produced and the fingerprint of the inputs that
//! produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StateError;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of cycle records retained in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// The last-applied state of one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identifier shared by every snapshot descending from the same first commit.
    pub lineage: String,
    /// Incremented on every commit.
    pub serial: u64,
    /// Environment name.
    pub environment: String,
    /// Realized modules by name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleState>,
    /// When the snapshot was last modified.
    pub last_updated: DateTime<Utc>,
    /// Recent cycles, oldest first.
    #[serde(default)]
    pub history: Vec<CycleRecord>,
}

/// A realized module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleState {
    /// Module kind at the time it was applied.
    pub kind: String,
    /// Fingerprint of the resolved inputs that produced `outputs`.
    pub fingerprint: String,
    /// Outputs returned by the provisioner.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Effective dependencies at the time it was applied.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// When the module was last applied.
    pub applied_at: DateTime<Utc>,
}

/// Kind of cycle recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleOperation {
    /// Plan applied against the desired configuration.
    Apply,
    /// Every module destroyed.
    Teardown,
}

/// One entry in the snapshot history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleRecord {
    /// When the cycle committed.
    pub timestamp: DateTime<Utc>,
    /// Serial the cycle committed.
    pub serial: u64,
    /// Type of cycle.
    pub operation: CycleOperation,
    /// Commit or operator that triggered the cycle.
    #[serde(default)]
    pub trigger: Option<String>,
    /// Modules changed by the cycle, in application order.
    pub changed: Vec<String>,
    /// Whether every planned step was applied.
    pub success: bool,
    /// Failure detail.
    #[serde(default)]
    pub error: Option<String>,
}

impl StateSnapshot {
    /// Creates an empty snapshot with a fresh lineage.
    #[must_use]
    pub fn empty(environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            environment: environment.to_string(),
            modules: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if no module has been realized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Gets a module by name.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleState> {
        self.modules.get(name)
    }

    /// Gets a realized output.
    #[must_use]
    pub fn output(&self, module: &str, output: &str) -> Option<&Value> {
        self.modules.get(module).and_then(|m| m.outputs.get(output))
    }

    /// Records a module as applied.
    pub fn set_module(&mut self, name: &str, module: ModuleState) {
        self.modules.insert(name.to_string(), module);
        self.last_updated = Utc::now();
    }

    /// Removes a module.
    pub fn remove_module(&mut self, name: &str) -> Option<ModuleState> {
        let removed = self.modules.remove(name);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Adds a history record, keeping only the most recent ones.
    pub fn add_history(&mut self, record: CycleRecord) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(record);
    }

    /// Returns the module names.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }

    /// Checks that the snapshot was written by a compatible version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionMismatch`] otherwise.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }
}

impl ModuleState {
    /// Creates a module state applied now.
    #[must_use]
    pub fn new(kind: &str, fingerprint: &str, outputs: BTreeMap<String, Value>) -> Self {
        Self {
            kind: kind.to_string(),
            fingerprint: fingerprint.to_string(),
            outputs,
            depends_on: Vec::new(),
            applied_at: Utc::now(),
        }
    }

    /// Records the module's dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

impl CycleRecord {
    /// Creates a record for a cycle committed at `serial`.
    #[must_use]
    pub fn new(serial: u64, operation: CycleOperation, changed: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            serial,
            operation,
            trigger: None,
            changed,
            success: true,
            error: None,
        }
    }

    /// Sets the trigger.
    #[must_use]
    pub fn triggered_by(mut self, trigger: Option<String>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Marks the record as failed.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for CycleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}
