//! TOML configuration for a router and its backends.
//!
//! ```toml
//! [router]
//! default_max_output_tokens = 4096
//! stream_first_timeout_secs = 30
//! stream_token_timeout_secs = 180
//!
//! [[backends]]
//! name = "default"
//! vendor = "anthropic"
//! model = "claude-sonnet-4-20250514"
//! api_key_env = "ANTHROPIC_API_KEY"
//! ```

use crate::registry::{BackendConfig, BackendOptions, Resolvable, DEFAULT_BACKEND};
use crate::router::{ModelRouter, RouterSettings};
use crate::vendor::Vendor;
use relay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// A whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// The `[router]` table.
    #[serde(default)]
    pub router: RouterSection,
    /// The `[[backends]]` tables, in file order.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

/// The `[router]` table; every key is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// See [`RouterSettings::default_max_output_tokens`].
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: Option<u32>,
    /// Seconds allowed for dispatch plus the first output chunk. Must be positive.
    #[serde(default = "default_first_timeout_secs")]
    pub stream_first_timeout_secs: u64,
    /// Seconds allowed between chunks of an accepted stream. Must be positive.
    #[serde(default = "default_token_timeout_secs")]
    pub stream_token_timeout_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            default_max_output_tokens: default_max_output_tokens(),
            stream_first_timeout_secs: default_first_timeout_secs(),
            stream_token_timeout_secs: default_token_timeout_secs(),
        }
    }
}

impl From<&RouterSection> for RouterSettings {
    fn from(section: &RouterSection) -> Self {
        Self {
            default_max_output_tokens: section.default_max_output_tokens,
            stream_first_timeout: Duration::from_secs(section.stream_first_timeout_secs),
            stream_token_timeout: Duration::from_secs(section.stream_token_timeout_secs),
        }
    }
}

/// One `[[backends]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    /// Unique backend name; one entry must be `default`.
    pub name: String,
    /// Vendor key, e.g. `"anthropic"` or `"openai-compatible"`.
    pub vendor: Vendor,
    /// Model identifier.
    pub model: String,
    /// Literal credential. Prefer `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable read on every attempt.
    pub api_key_env: Option<String>,
    /// Literal endpoint override.
    pub base_url: Option<String>,
    /// Environment variable holding the endpoint, read on every attempt.
    pub base_url_env: Option<String>,
    /// See [`BackendOptions::temperature`].
    pub temperature: Option<f32>,
    /// See [`BackendOptions::top_p`].
    pub top_p: Option<f32>,
    /// See [`BackendOptions::top_k`].
    pub top_k: Option<u32>,
    /// See [`BackendOptions::max_output_tokens`].
    pub max_output_tokens: Option<u32>,
    /// OpenAI organization.
    pub organization: Option<String>,
    /// OpenAI project.
    pub project: Option<String>,
    /// Azure `api-version`.
    pub api_version: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Vendor-specific body fields.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_max_output_tokens() -> Option<u32> {
    Some(4096)
}
fn default_first_timeout_secs() -> u64 {
    30
}
fn default_token_timeout_secs() -> u64 {
    180
}

impl RelayConfig {
    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(raw: &str) -> RelayResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants a router relies on.
    pub fn validate(&self) -> RelayResult<()> {
        if self.backends.is_empty() {
            return Err(RelayError::Config("at least one backend is required".into()));
        }
        for (key, secs) in [
            ("stream_first_timeout_secs", self.router.stream_first_timeout_secs),
            ("stream_token_timeout_secs", self.router.stream_token_timeout_secs),
        ] {
            if secs == 0 {
                return Err(RelayError::Config(format!("{key} must be greater than zero")));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.backends {
            if !seen.insert(entry.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate backend name '{}'",
                    entry.name
                )));
            }
            if entry.api_key.is_some() && entry.api_key_env.is_some() {
                return Err(RelayError::Config(format!(
                    "backend '{}': set either api_key or api_key_env, not both",
                    entry.name
                )));
            }
            if entry.base_url.is_some() && entry.base_url_env.is_some() {
                return Err(RelayError::Config(format!(
                    "backend '{}': set either base_url or base_url_env, not both",
                    entry.name
                )));
            }
        }

        if !seen.contains(DEFAULT_BACKEND) {
            return Err(RelayError::Config(format!(
                "a backend named '{DEFAULT_BACKEND}' is required"
            )));
        }
        Ok(())
    }

    /// Router-wide settings from the `[router]` table.
    pub fn settings(&self) -> RouterSettings {
        RouterSettings::from(&self.router)
    }

    /// Validates and builds a router over the configured backends.
    pub fn into_router(self) -> RelayResult<ModelRouter> {
        self.validate()?;
        let settings = self.settings();
        let backends = self.backends.into_iter().map(BackendEntry::into_config).collect();
        ModelRouter::new(backends, settings)
    }
}

impl BackendEntry {
    /// Converts the entry into a backend configuration.
    pub fn into_config(self) -> BackendConfig {
        let credential = match (self.api_key, self.api_key_env) {
            (Some(key), _) => Some(Resolvable::Literal(key)),
            (None, Some(var)) => Some(env_var(var)),
            (None, None) => None,
        };
        let endpoint = match (self.base_url, self.base_url_env) {
            (Some(url), _) => Some(Resolvable::Literal(url)),
            (None, Some(var)) => Some(env_var(var)),
            (None, None) => None,
        };

        BackendConfig {
            credential,
            options: BackendOptions {
                endpoint,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                max_output_tokens: self.max_output_tokens,
                organization: self.organization,
                project: self.project,
                api_version: self.api_version,
                extra: self.extra,
                headers: self.headers,
            },
            ..BackendConfig::new(self.name, self.vendor, self.model)
        }
    }
}

/// A resolver that reads `var` from the environment each time it runs.
pub fn env_var(var: impl Into<String>) -> Resolvable {
    let var = var.into();
    Resolvable::deferred(move || {
        let var = var.clone();
        async move {
            std::env::var(&var).map_err(|_| {
                RelayError::Resolution(format!("environment variable '{var}' is not set"))
            })
        }
    })
}
