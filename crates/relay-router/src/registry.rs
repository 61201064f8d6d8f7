use crate::backends::LlmBackend;
use crate::vendor::{self, Vendor};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use relay_core::{ChatRequest, RelayError, RelayResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Name of the backend every registry must contain.
pub const DEFAULT_BACKEND: &str = "default";

/// An async function producing a credential or endpoint on demand.
pub type ResolveFn = Arc<dyn Fn() -> BoxFuture<'static, RelayResult<String>> + Send + Sync>;

/// Hook that adjusts a request for one backend right before dispatch.
pub type RequestTransform = Arc<dyn Fn(&mut ChatRequest) + Send + Sync>;

/// A setting that is either known up front or resolved on every attempt.
#[derive(Clone)]
pub enum Resolvable {
    /// A fixed value.
    Literal(String),
    /// Produced by an async function each time it is needed.
    Deferred(ResolveFn),
}

impl Resolvable {
    /// Wraps an async function; it runs again for every attempt so rotated
    /// secrets are picked up.
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelayResult<String>> + Send + 'static,
    {
        Resolvable::Deferred(Arc::new(move || f().boxed()))
    }

    /// Produces the current value.
    pub async fn resolve(&self) -> RelayResult<String> {
        match self {
            Resolvable::Literal(value) => Ok(value.clone()),
            Resolvable::Deferred(f) => f().await,
        }
    }
}

impl From<&str> for Resolvable {
    fn from(value: &str) -> Self {
        Resolvable::Literal(value.to_string())
    }
}

impl From<String> for Resolvable {
    fn from(value: String) -> Self {
        Resolvable::Literal(value)
    }
}

impl fmt::Debug for Resolvable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolvable::Literal(_) => f.write_str("Literal(..)"),
            Resolvable::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Per-backend defaults and vendor knobs.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Replaces the vendor's default endpoint.
    pub endpoint: Option<Resolvable>,
    /// Default temperature when the call sets none.
    pub temperature: Option<f32>,
    /// Default `top_p` when the call sets none.
    pub top_p: Option<f32>,
    /// Default `top_k` when the call sets none.
    pub top_k: Option<u32>,
    /// Default output token cap, ahead of the router-wide default.
    pub max_output_tokens: Option<u32>,
    /// OpenAI organization; selects the native OpenAI client.
    pub organization: Option<String>,
    /// OpenAI project; selects the native OpenAI client.
    pub project: Option<String>,
    /// Azure `api-version` query parameter.
    pub api_version: Option<String>,
    /// Vendor-specific request fields, merged into the provider-option
    /// namespace of the serving vendor.
    pub extra: serde_json::Map<String, serde_json::Value>,
    /// Extra request headers; a key matching a vendor header replaces it.
    pub headers: BTreeMap<String, String>,
}

/// One named route to a model.
#[derive(Clone)]
pub struct BackendConfig {
    /// Name callers use to prefer this backend.
    pub name: String,
    /// Wire dialect, or a pass-through client.
    pub vendor: Vendor,
    /// Model identifier sent to the vendor.
    pub model: String,
    /// API key, resolved on every attempt.
    pub credential: Option<Resolvable>,
    /// Defaults and vendor knobs.
    pub options: BackendOptions,
    /// Runs on the per-attempt copy of the request before dispatch.
    pub request_transform: Option<RequestTransform>,
    /// Custom transport (proxies, timeouts, TLS roots).
    pub http: Option<reqwest::Client>,
}

impl BackendConfig {
    /// Creates a backend with no credential and default options.
    pub fn new(name: impl Into<String>, vendor: Vendor, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor,
            model: model.into(),
            credential: None,
            options: BackendOptions::default(),
            request_transform: None,
            http: None,
        }
    }

    /// Wraps an already-built client as a backend.
    pub fn custom(name: impl Into<String>, backend: Arc<dyn LlmBackend>) -> Self {
        Self::new(name, Vendor::Custom(backend), "")
    }

    /// Sets a literal API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.credential = Some(Resolvable::Literal(key.into()));
        self
    }

    /// Sets a credential that may be resolved lazily.
    #[must_use]
    pub fn with_credential(mut self, credential: Resolvable) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Overrides the vendor's default endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<Resolvable>) -> Self {
        self.options.endpoint = Some(endpoint.into());
        self
    }

    /// Replaces all options, including a previously set endpoint.
    #[must_use]
    pub fn with_options(mut self, options: BackendOptions) -> Self {
        self.options = options;
        self
    }

    /// Installs a hook that edits the request before each dispatch.
    #[must_use]
    pub fn with_request_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ChatRequest) + Send + Sync + 'static,
    {
        self.request_transform = Some(Arc::new(f));
        self
    }

    /// Uses the given HTTP client instead of a default one.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .field("options", &self.options)
            .field("request_transform", &self.request_transform.is_some())
            .finish_non_exhaustive()
    }
}

/// A backend ready to dispatch: its configuration plus a freshly built client.
#[derive(Clone)]
pub struct ResolvedBackend {
    /// The configuration this client was built from.
    pub config: Arc<BackendConfig>,
    /// The live client.
    pub client: Arc<dyn LlmBackend>,
}

impl ResolvedBackend {
    /// Configured backend name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Vendor key of the live client, which may differ from the configured
    /// vendor for pass-through clients.
    pub fn vendor(&self) -> &str {
        self.client.vendor()
    }
}

/// Immutable table of backend configurations, keyed by name.
///
/// Live clients are not cached: [`BackendRegistry::resolve`] re-evaluates the
/// credential and endpoint and builds a new client every time.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<BackendConfig>>,
    order: Vec<String>,
}

impl BackendRegistry {
    /// Builds a registry; fails on duplicate names or a missing `default` entry.
    pub fn new(configs: Vec<BackendConfig>) -> RelayResult<Self> {
        let mut backends = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());

        for config in configs {
            if config.name.is_empty() {
                return Err(RelayError::Config("backend name must not be empty".into()));
            }
            if backends.contains_key(&config.name) {
                return Err(RelayError::Config(format!(
                    "duplicate backend name '{}'",
                    config.name
                )));
            }
            order.push(config.name.clone());
            backends.insert(config.name.clone(), Arc::new(config));
        }

        if !backends.contains_key(DEFAULT_BACKEND) {
            return Err(RelayError::Config(format!(
                "a backend named '{DEFAULT_BACKEND}' is required"
            )));
        }

        Ok(Self { backends, order })
    }

    /// Looks up a configuration by name.
    pub fn get(&self, name: &str) -> Option<&Arc<BackendConfig>> {
        self.backends.get(name)
    }

    /// Backend names in configuration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of configured backends.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Always false for a registry built by [`BackendRegistry::new`].
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Resolves `name` into a live client.
    ///
    /// Returns `Ok(None)` for unknown names. Credential, endpoint and
    /// construction failures are returned as errors.
    pub async fn resolve(&self, name: &str) -> RelayResult<Option<ResolvedBackend>> {
        let Some(config) = self.backends.get(name) else {
            return Ok(None);
        };

        let credential = match &config.credential {
            Some(c) => Some(c.resolve().await?),
            None => None,
        };
        let endpoint = match &config.options.endpoint {
            Some(e) => Some(e.resolve().await?),
            None => None,
        };

        let client = vendor::build_client(config, credential, endpoint)?;
        Ok(Some(ResolvedBackend {
            config: Arc::clone(config),
            client,
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_registry_requires_default() {
        let err = BackendRegistry::new(vec![BackendConfig::new(
            "primary",
            Vendor::Ollama,
            "llama3",
        )])
        .unwrap_err();
        assert!(err.to_string().contains("'default'"));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = BackendRegistry::new(vec![
            BackendConfig::new("default", Vendor::Ollama, "a"),
            BackendConfig::new("default", Vendor::Ollama, "b"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn test_unknown_name_resolves_to_none() {
        let registry =
            BackendRegistry::new(vec![BackendConfig::new("default", Vendor::Ollama, "llama3")])
                .unwrap();
        assert!(registry.resolve("missing").await.unwrap().is_none());
        let resolved = registry.resolve("default").await.unwrap().unwrap();
        assert_eq!(resolved.name(), "default");
        assert_eq!(resolved.vendor(), "ollama");
    }

    #[tokio::test]
    async fn test_deferred_credential_runs_on_every_resolve() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let config = BackendConfig::new("default", Vendor::Anthropic, "claude")
            .with_credential(Resolvable::deferred(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(format!("sk-rotated-{n}")) }
            }));
        let registry = BackendRegistry::new(vec![config]).unwrap();

        registry.resolve("default").await.unwrap();
        registry.resolve("default").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_credential_propagates() {
        let config = BackendConfig::new("default", Vendor::OpenAi, "gpt").with_credential(
            Resolvable::deferred(|| async {
                Err(RelayError::Resolution("vault unavailable".into()))
            }),
        );
        let registry = BackendRegistry::new(vec![config]).unwrap();
        let err = registry.resolve("default").await.err().unwrap();
        assert!(err.to_string().contains("vault unavailable"));
    }

    #[test]
    fn test_debug_redacts_credential() {
        let config = BackendConfig::new("default", Vendor::OpenAi, "gpt").with_api_key("sk-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("Literal(..)"));
    }
}
