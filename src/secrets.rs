//! Secret lookup for event sources
//!
//! Event source configurations never embed credentials; they name a secret
//! with a [`SecretSelector`] (`name` + `key`) and the gateway resolves it
//! through a [`SecretStore`]. A missing optional secret is a valid, degraded
//! state (e.g. unsigned webhooks), so lookups return `Ok(None)` rather than an
//! error when nothing is stored under the selector.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Reference to one value inside a named secret
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretSelector {
    /// Secret name
    pub name: String,
    /// Key inside the secret
    pub key: String,
}

impl SecretSelector {
    /// Create a selector
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for SecretSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.key)
    }
}

/// Credential store consulted by listeners when they start
pub trait SecretStore: Send + Sync {
    /// Look up a secret value; `Ok(None)` when it is not stored
    fn get(&self, selector: &SecretSelector) -> Result<Option<String>>;

    /// Look up a secret that must be present
    fn require(&self, selector: &SecretSelector) -> Result<String> {
        self.get(selector)?
            .ok_or_else(|| Error::Config(format!("secret {selector} not found")))
    }
}

/// Secret store backed by process environment variables
///
/// `{name: slack-secret, key: signing-secret}` with prefix
/// `EVENT_GATEWAY_SECRET_` reads `EVENT_GATEWAY_SECRET_SLACK_SECRET_SIGNING_SECRET`.
pub struct EnvSecretStore {
    prefix: String,
    /// Resolved values, kept for the life of the process
    cache: DashMap<SecretSelector, String>,
}

impl EnvSecretStore {
    /// Create a store reading variables with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cache: DashMap::new(),
        }
    }

    /// Environment variable name for a selector
    #[must_use]
    pub fn variable_name(&self, selector: &SecretSelector) -> String {
        let normalize = |s: &str| {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };
        format!(
            "{}{}_{}",
            self.prefix,
            normalize(&selector.name),
            normalize(&selector.key)
        )
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, selector: &SecretSelector) -> Result<Option<String>> {
        if let Some(cached) = self.cache.get(selector) {
            return Ok(Some(cached.clone()));
        }

        let var = self.variable_name(selector);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => {
                self.cache.insert(selector.clone(), value.clone());
                Ok(Some(value))
            }
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                tracing::debug!(secret = %selector, variable = %var, "Secret not set");
                Ok(None)
            }
            Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
                "secret variable {var} is not valid unicode"
            ))),
        }
    }
}

/// In-memory secret store
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: DashMap<SecretSelector, String>,
}

impl MemorySecretStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one
    pub fn insert(&self, selector: SecretSelector, value: impl Into<String>) {
        self.secrets.insert(selector, value.into());
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(self, name: &str, key: &str, value: &str) -> Self {
        self.insert(SecretSelector::new(name, key), value);
        self
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, selector: &SecretSelector) -> Result<Option<String>> {
        Ok(self.secrets.get(selector).map(|v| v.clone()))
    }
}
