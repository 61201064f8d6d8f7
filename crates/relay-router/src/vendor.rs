//! Vendor dialects and the single place that turns a resolved backend
//! configuration into a live client.

use crate::backends::anthropic::{self, AnthropicBackend};
use crate::backends::openai::{self, OpenAiBackend, OpenAiDialect};
use crate::backends::{compose_headers, ClientSettings, LlmBackend};
use crate::registry::{BackendConfig, BackendOptions};
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The wire dialect a backend speaks.
///
/// Every variant except [`Vendor::Custom`] names a known vendor with its own
/// default endpoint and header conventions. `Custom` wraps an already-built
/// client and is used as-is.
#[derive(Clone, Serialize, Deserialize)]
pub enum Vendor {
    /// The Anthropic messages API.
    #[serde(rename = "anthropic")]
    Anthropic,
    /// OpenAI itself, or any service speaking its dialect at another endpoint.
    #[serde(rename = "openai")]
    OpenAi,
    /// Azure OpenAI deployments.
    #[serde(rename = "azure")]
    Azure,
    /// OpenRouter; sends attribution headers.
    #[serde(rename = "openrouter")]
    OpenRouter,
    /// Groq's OpenAI-compatible endpoint.
    #[serde(rename = "groq")]
    Groq,
    /// DeepSeek's OpenAI-compatible endpoint.
    #[serde(rename = "deepseek")]
    DeepSeek,
    /// A local Ollama server; no credential required.
    #[serde(rename = "ollama")]
    Ollama,
    /// A self-hosted OpenAI-compatible server; requires an endpoint.
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    /// A pre-built client for an arbitrary provider.
    #[serde(skip)]
    Custom(Arc<dyn LlmBackend>),
}

impl Vendor {
    /// Stable identifier, also used as the provider-option namespace.
    pub fn key(&self) -> &str {
        match self {
            Vendor::Anthropic => anthropic::VENDOR,
            Vendor::OpenAi => "openai",
            Vendor::Azure => "azure",
            Vendor::OpenRouter => "openrouter",
            Vendor::Groq => "groq",
            Vendor::DeepSeek => "deepseek",
            Vendor::Ollama => "ollama",
            Vendor::OpenAiCompatible => "openai-compatible",
            Vendor::Custom(backend) => backend.vendor(),
        }
    }

    /// The endpoint used when the configuration does not override it.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Vendor::Anthropic => Some(anthropic::DEFAULT_BASE_URL),
            Vendor::OpenAi => Some(openai::DEFAULT_BASE_URL),
            Vendor::OpenRouter => Some("https://openrouter.ai/api"),
            Vendor::Groq => Some("https://api.groq.com/openai"),
            Vendor::DeepSeek => Some("https://api.deepseek.com"),
            Vendor::Ollama => Some("http://localhost:11434"),
            Vendor::Azure | Vendor::OpenAiCompatible | Vendor::Custom(_) => None,
        }
    }

    fn requires_credential(&self) -> bool {
        !matches!(
            self,
            Vendor::Ollama | Vendor::OpenAiCompatible | Vendor::Custom(_)
        )
    }
}

impl fmt::Debug for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Custom(backend) => write!(f, "Custom({})", backend.vendor()),
            other => f.write_str(other.key()),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether an `openai` backend should use the native client rather than the
/// compatible dialect: no endpoint override, an endpoint on `openai.com`, or
/// organization/project options.
pub fn uses_native_openai(endpoint: Option<&str>, options: &BackendOptions) -> bool {
    if options.organization.is_some() || options.project.is_some() {
        return true;
    }
    let Some(endpoint) = endpoint else {
        return true;
    };
    match reqwest::Url::parse(endpoint) {
        Ok(url) => url
            .host_str()
            .is_some_and(|host| host == "openai.com" || host.ends_with(".openai.com")),
        Err(_) => endpoint.contains("openai.com"),
    }
}

/// Builds the live client for `config` from an already-resolved credential and endpoint.
pub(crate) fn build_client(
    config: &BackendConfig,
    credential: Option<String>,
    endpoint: Option<String>,
) -> RelayResult<Arc<dyn LlmBackend>> {
    if let Vendor::Custom(backend) = &config.vendor {
        return Ok(Arc::clone(backend));
    }

    let vendor = &config.vendor;
    if credential.is_none() && vendor.requires_credential() {
        return Err(RelayError::Resolution(format!(
            "backend '{}' ({vendor}) requires a credential",
            config.name
        )));
    }

    let base_url = endpoint
        .clone()
        .or_else(|| vendor.default_base_url().map(str::to_string))
        .ok_or_else(|| {
            RelayError::Resolution(format!(
                "backend '{}' ({vendor}) requires an endpoint",
                config.name
            ))
        })?;

    let options = &config.options;
    let bearer = credential.as_ref().map(|key| ("authorization", format!("Bearer {key}")));
    let mut base_headers: Vec<(&str, String)> = Vec::new();

    let dialect = match vendor {
        Vendor::Anthropic => {
            if let Some(key) = &credential {
                base_headers.push(("x-api-key", key.clone()));
            }
            base_headers.push(("anthropic-version", anthropic::API_VERSION.to_string()));
            None
        }
        Vendor::Azure => {
            if let Some(key) = &credential {
                base_headers.push(("api-key", key.clone()));
            }
            Some(OpenAiDialect::Azure {
                api_version: options
                    .api_version
                    .clone()
                    .unwrap_or_else(|| openai::DEFAULT_AZURE_API_VERSION.to_string()),
            })
        }
        Vendor::OpenAi if uses_native_openai(endpoint.as_deref(), options) => {
            base_headers.extend(bearer);
            if let Some(org) = &options.organization {
                base_headers.push(("openai-organization", org.clone()));
            }
            if let Some(project) = &options.project {
                base_headers.push(("openai-project", project.clone()));
            }
            Some(OpenAiDialect::Native)
        }
        Vendor::OpenRouter => {
            base_headers.extend(bearer);
            base_headers.push(("http-referer", "https://github.com/relay-rs/relay".to_string()));
            base_headers.push(("x-title", "relay".to_string()));
            Some(OpenAiDialect::Compatible)
        }
        _ => {
            base_headers.extend(bearer);
            Some(OpenAiDialect::Compatible)
        }
    };

    let headers = compose_headers(&base_headers, &options.headers)?;
    debug!(
        backend = %config.name,
        vendor = %vendor,
        dialect = ?dialect,
        headers = ?headers.keys().collect::<Vec<_>>(),
        "Built live client"
    );

    let settings = ClientSettings {
        model: config.model.clone(),
        base_url,
        headers,
        http: config.http.clone().unwrap_or_default(),
    };

    Ok(match dialect {
        None => Arc::new(AnthropicBackend::new(settings)),
        Some(dialect) => Arc::new(OpenAiBackend::new(settings, dialect, vendor.key())),
    })
}
