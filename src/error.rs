//! Error types for the keel reconciliation system.
//!
//! Every stage of a cycle has its own error enum: configuration, graph
//! construction, state storage and locking, planning, provisioning and the
//! pipeline state machine. [`KeelError`] wraps them all.

use std::path::PathBuf;
use thiserror::Error;

use crate::planner::PartialApplyError;

/// The main error type for keel.
#[derive(Debug, Error)]
pub enum KeelError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State storage and locking errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// A single provisioning call failed outside of a plan execution.
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// A plan stopped before completing; carries everything that was applied.
    #[error("{0}")]
    PartialApply(Box<PartialApplyError>),

    /// Pipeline state machine errors.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// The requested environment is not declared.
    #[error("Unknown environment: {name}")]
    UnknownEnvironment {
        /// The environment name that was requested.
        name: String,
    },

    /// Two environments claim the same trigger branch.
    #[error("Branch '{branch}' is mapped to both '{first}' and '{second}'")]
    DuplicateBranch {
        /// The contested branch.
        branch: String,
        /// Environment declared first.
        first: String,
        /// Environment declared second.
        second: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The dependency relation contains a cycle.
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle {
        /// Modules along the cycle; the first module is repeated at the end.
        cycle: Vec<String>,
    },

    /// A module depends on an identifier that is not declared.
    #[error("Module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency {
        /// The module declaring the dependency.
        module: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Two modules share an identifier.
    #[error("Duplicate module: {name}")]
    DuplicateModule {
        /// The duplicated identifier.
        name: String,
    },
}

/// State storage and locking errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The lock could not be written or removed.
    #[error("Failed to manage state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Another holder owns the environment lock.
    #[error(
        "State for '{environment}' is locked by {holder} (lock {lock_id}, since {since}, expires {expires_at}, stale: {stale})"
    )]
    LockHeld {
        /// Environment whose lock is held.
        environment: String,
        /// Identifier of the lock holder.
        holder: String,
        /// Identifier of the held lock.
        lock_id: String,
        /// When the lock was acquired.
        since: String,
        /// When the lock expires.
        expires_at: String,
        /// Whether the lock is past its expiry and may be broken.
        stale: bool,
    },

    /// The caller's lock has expired or was replaced.
    #[error("Lock {lock_id} for '{environment}' is no longer held")]
    LockExpired {
        /// Environment the lock belonged to.
        environment: String,
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// The stored snapshot is newer than the one being committed.
    #[error("Refusing to overwrite state serial {stored} with serial {attempted}")]
    SerialConflict {
        /// Serial currently stored.
        stored: u64,
        /// Serial of the rejected snapshot.
        attempted: u64,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// An input references an output its dependency never produced.
    #[error("Module '{module}' input '{input}' references '{reference}', which is not available")]
    UnresolvedOutput {
        /// The module being planned.
        module: String,
        /// The input holding the reference.
        input: String,
        /// The `module.output` reference.
        reference: String,
    },

    /// The execution order does not cover a desired module.
    #[error("Module '{module}' is missing from the execution order")]
    OrderMismatch {
        /// The module absent from the order.
        module: String,
    },
}

/// Errors raised by a provisioning collaborator for a single step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// No capability is registered for the module kind.
    #[error("No provisioner registered for module kind '{kind}'")]
    NoProvisioner {
        /// The unsupported kind.
        kind: String,
    },

    /// The collaborator rejected the request.
    #[error("Provisioner rejected request: {status} - {message}")]
    Rejected {
        /// HTTP status code (or 0 for non-HTTP drivers).
        status: u16,
        /// Error message returned.
        message: String,
    },

    /// The collaborator asked the caller to slow down.
    #[error("Provisioner rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error talking to the collaborator.
    #[error("Network error talking to provisioner: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The collaborator's response could not be understood.
    #[error("Invalid response from provisioner: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The step exceeded its timeout.
    #[error("Step for module '{module}' timed out after {after_secs}s")]
    Timeout {
        /// The module whose step timed out.
        module: String,
        /// The configured timeout.
        after_secs: u64,
    },

    /// The collaborator did not return every declared output.
    #[error("Module '{module}' did not produce declared outputs: {}", .missing.join(", "))]
    MissingOutputs {
        /// The module that was applied.
        module: String,
        /// Declared outputs that were absent from the result.
        missing: Vec<String>,
    },

    /// An output reference could not be resolved at apply time.
    #[error("Module '{module}' input '{input}' references '{reference}', which is not available")]
    UnresolvedInput {
        /// The module being applied.
        module: String,
        /// The input holding the reference.
        input: String,
        /// The `module.output` reference.
        reference: String,
    },

    /// Any other collaborator failure.
    #[error("Provisioning failed: {message}")]
    Failed {
        /// Failure detail.
        message: String,
    },
}

/// Pipeline state machine errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A transition that the state machine does not allow.
    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The approval gate rejected the plan.
    #[error("Plan was not approved: {reason}")]
    ApprovalRejected {
        /// Why the plan was rejected.
        reason: String,
    },

    /// The cycle was cancelled before it could finish.
    #[error("Cycle cancelled")]
    Cancelled,
}

/// Result type alias for keel operations.
pub type Result<T> = std::result::Result<T, KeelError>;

impl From<PartialApplyError> for KeelError {
    fn from(err: PartialApplyError) -> Self {
        Self::PartialApply(Box::new(err))
    }
}

impl KeelError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if re-triggering the cycle later may succeed unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provision(
                ProvisionError::RateLimited { .. } | ProvisionError::Network { .. }
            ) | Self::State(StateError::LockHeld { .. } | StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provision(ProvisionError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provision(ProvisionError::Network { .. }) => Some(5),
            Self::State(StateError::LockHeld { .. } | StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns the partial-apply detail if this error carries one.
    #[must_use]
    pub fn partial_apply(&self) -> Option<&PartialApplyError> {
        match self {
            Self::PartialApply(partial) => Some(partial),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProvisionError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}
