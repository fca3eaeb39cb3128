//! Kind → provisioner lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::ProvisionerConfig;
use crate::error::{ConfigError, KeelError, ProvisionError, Result};

use super::{EchoProvisioner, HttpProvisioner, Provisioner, StepResult};

/// Maps module kinds to the capability that provisions them.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    by_kind: BTreeMap<String, Arc<dyn Provisioner>>,
}

impl fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl ProvisionerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the capability for a kind.
    pub fn register(&mut self, kind: &str, provisioner: Arc<dyn Provisioner>) {
        debug!(kind, driver = provisioner.driver(), "Registered provisioner");
        self.by_kind.insert(kind.to_string(), provisioner);
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with(mut self, kind: &str, provisioner: Arc<dyn Provisioner>) -> Self {
        self.register(kind, provisioner);
        self
    }

    /// Looks up the capability for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoProvisioner`] if nothing handles `kind`.
    pub fn get(&self, kind: &str) -> StepResult<Arc<dyn Provisioner>> {
        self.by_kind
            .get(kind)
            .cloned()
            .ok_or_else(|| ProvisionError::NoProvisioner {
                kind: kind.to_string(),
            })
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.by_kind.keys().map(String::as_str).collect()
    }

    /// Builds a registry from the `provisioners` section, reading tokens
    /// from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced token variable is unset or an HTTP
    /// client cannot be created.
    pub fn from_config(provisioners: &BTreeMap<String, ProvisionerConfig>) -> Result<Self> {
        Self::from_config_with(provisioners, |name| std::env::var(name).ok())
    }

    /// Like [`Self::from_config`] with an explicit variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced token variable is unset or an HTTP
    /// client cannot be created.
    pub fn from_config_with<F>(
        provisioners: &BTreeMap<String, ProvisionerConfig>,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::new();
        for (kind, settings) in provisioners {
            let provisioner: Arc<dyn Provisioner> = match settings {
                ProvisionerConfig::Echo => Arc::new(EchoProvisioner::new()),
                ProvisionerConfig::Http {
                    endpoint,
                    token_env,
                    timeout_secs,
                } => {
                    let token = match token_env {
                        Some(var) => Some(lookup(var).ok_or_else(|| {
                            KeelError::Config(ConfigError::MissingEnvVar { name: var.clone() })
                        })?),
                        None => None,
                    };
                    Arc::new(HttpProvisioner::new(
                        endpoint,
                        token,
                        Duration::from_secs(*timeout_secs),
                    )?)
                }
            };
            registry.register(kind, provisioner);
        }
        Ok(registry)
    }

    /// A registry that echoes every listed kind, for dry runs.
    #[must_use]
    pub fn echo_for<'a>(kinds: impl IntoIterator<Item = &'a str>) -> Self {
        let echo: Arc<dyn Provisioner> = Arc::new(EchoProvisioner::new());
        let mut registry = Self::new();
        for kind in kinds {
            registry.register(kind, Arc::clone(&echo));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(token_env: Option<&str>) -> ProvisionerConfig {
        ProvisionerConfig::Http {
            endpoint: String::from("https://provisioner.internal"),
            token_env: token_env.map(String::from),
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ProvisionerRegistry::echo_for(["network"]);
        assert!(registry.get("network").is_ok());
        assert_eq!(
            registry.get("cluster").err(),
            Some(ProvisionError::NoProvisioner {
                kind: String::from("cluster")
            })
        );
    }

    #[test]
    fn test_from_config_resolves_tokens() {
        let provisioners = BTreeMap::from([
            (String::from("cluster"), http(Some("CLUSTER_TOKEN"))),
            (String::from("network"), ProvisionerConfig::Echo),
        ]);

        let registry = ProvisionerRegistry::from_config_with(&provisioners, |name| {
            (name == "CLUSTER_TOKEN").then(|| String::from("t"))
        })
        .expect("registry builds");

        assert_eq!(registry.kinds(), vec!["cluster", "network"]);
        assert_eq!(registry.get("cluster").map(|p| p.driver()), Ok("http"));
        assert_eq!(registry.get("network").map(|p| p.driver()), Ok("echo"));
    }

    #[test]
    fn test_missing_token_variable() {
        let provisioners = BTreeMap::from([(String::from("cluster"), http(Some("NOPE")))]);
        let err = ProvisionerRegistry::from_config_with(&provisioners, |_| None).unwrap_err();
        assert!(matches!(
            err,
            KeelError::Config(ConfigError::MissingEnvVar { ref name }) if name == "NOPE"
        ));
    }
}
