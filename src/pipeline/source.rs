//! Source-control events and the configuration they select.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::config::{ConfigParser, KeelConfig};
use crate::error::Result;

/// A push to a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Branch name, with or without `refs/heads/`.
    pub branch: String,
    /// Commit identifier.
    pub commit: String,
}

impl SourceEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(branch: &str, commit: &str) -> Self {
        Self {
            branch: branch.to_string(),
            commit: commit.to_string(),
        }
    }
}

impl std::fmt::Display for SourceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.branch, self.commit)
    }
}

/// Produces the configuration an event refers to.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Loads the configuration for `event`.
    async fn load(&self, event: &SourceEvent) -> Result<KeelConfig>;
}

/// Reads the configuration file from the working tree.
///
/// The checkout is assumed to already be at the event's commit.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self, event: &SourceEvent) -> Result<KeelConfig> {
        debug!(%event, path = %self.path.display(), "Loading configuration");
        ConfigParser::new().load_with_env(&self.path)
    }
}

/// Always returns the same configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: KeelConfig,
}

impl StaticConfigSource {
    /// Wraps a configuration.
    #[must_use]
    pub const fn new(config: KeelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self, _event: &SourceEvent) -> Result<KeelConfig> {
        Ok(self.config.clone())
    }
}
