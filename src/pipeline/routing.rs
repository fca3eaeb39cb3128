//! Branch → environment lookup.

use std::collections::BTreeMap;

use crate::config::KeelConfig;
use crate::error::ConfigError;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Static table mapping trigger branches to environments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchRouter {
    routes: BTreeMap<String, String>,
}

impl BranchRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from every environment's `branch`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateBranch`] if two environments claim the
    /// same branch.
    pub fn from_config(config: &KeelConfig) -> Result<Self, ConfigError> {
        let mut router = Self::new();
        for env in &config.environments {
            router.add_route(&env.branch, &env.name)?;
        }
        Ok(router)
    }

    /// Maps `branch` to `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateBranch`] if the branch is already mapped.
    pub fn add_route(&mut self, branch: &str, environment: &str) -> Result<(), ConfigError> {
        let branch = Self::normalize(branch);
        if let Some(first) = self.routes.get(branch) {
            return Err(ConfigError::DuplicateBranch {
                branch: branch.to_string(),
                first: first.clone(),
                second: environment.to_string(),
            });
        }
        self.routes.insert(branch.to_string(), environment.to_string());
        Ok(())
    }

    /// Environment for a branch, if any. `refs/heads/` prefixes are ignored.
    #[must_use]
    pub fn route(&self, branch: &str) -> Option<&str> {
        self.routes.get(Self::normalize(branch)).map(String::as_str)
    }

    /// Strips a leading `refs/heads/`.
    #[must_use]
    pub fn normalize(branch: &str) -> &str {
        branch.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(branch)
    }

    /// Routes as `(branch, environment)`, sorted by branch.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(b, e)| (b.as_str(), e.as_str()))
    }

    /// Returns true if no branch is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
