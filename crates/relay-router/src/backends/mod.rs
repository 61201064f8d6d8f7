/// Anthropic messages API.
pub mod anthropic;
/// OpenAI chat completions and compatible services.
pub mod openai;
pub(crate) mod sse;

use async_trait::async_trait;
use relay_core::{ChatCompletion, ChatRequest, ChunkStream, RelayError, RelayResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// A live client for one vendor dialect.
///
/// Each known vendor is served by an implementation in `backends/`; arbitrary
/// providers plug in by implementing this trait and registering the value
/// through [`Vendor::Custom`](crate::Vendor::Custom).
///
/// Implementations must honour `request.cancel`: once it fires, in-flight work
/// (including a spawned stream reader) should stop.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Vendor key used to namespace provider options (`"openai"`, `"anthropic"`, ...).
    fn vendor(&self) -> &str;

    /// Non-streaming chat completion.
    async fn chat(&self, request: &ChatRequest) -> RelayResult<ChatCompletion>;

    /// Streaming chat completion.
    ///
    /// Returns once the transport has accepted the request; chunks are pulled
    /// lazily from the returned stream.
    async fn chat_stream(&self, request: &ChatRequest) -> RelayResult<ChunkStream>;
}

/// Connection settings shared by the HTTP backends.
#[derive(Clone)]
pub struct ClientSettings {
    /// Model identifier sent to the vendor (the deployment name on Azure).
    pub model: String,
    /// Base URL without the API path (e.g. `https://api.openai.com`).
    pub base_url: String,
    /// Fully composed request headers (auth, vendor headers, custom headers).
    pub headers: HeaderMap,
    /// Transport used for every request of this client.
    pub http: reqwest::Client,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Merges vendor headers with caller-supplied custom headers.
///
/// `base` is applied first, then `custom`; on a matching name the later value
/// replaces the earlier one. Header names compare case-insensitively.
pub fn compose_headers(
    base: &[(&str, String)],
    custom: &BTreeMap<String, String>,
) -> RelayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let pairs = base
        .iter()
        .map(|(k, v)| (*k, v.as_str()))
        .chain(custom.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RelayError::Resolution(format!("invalid header name '{name}': {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| RelayError::Resolution(format!("invalid value for header '{name}': {e}")))?;
        if is_sensitive(&name) {
            value.set_sensitive(true);
        }
        headers.insert(name, value);
    }
    Ok(headers)
}

fn is_sensitive(name: &HeaderName) -> bool {
    matches!(name.as_str(), "authorization" | "x-api-key" | "api-key")
}

/// POSTs a JSON body and maps transport and status failures.
pub(crate) async fn post_json(
    settings: &ClientSettings,
    url: &str,
    body: &serde_json::Value,
) -> RelayResult<reqwest::Response> {
    let resp = settings
        .http
        .post(url)
        .headers(settings.headers.clone())
        .json(body)
        .send()
        .await
        .map_err(|e| RelayError::Http(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(RelayError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

/// Copies vendor-specific options into the request body. Existing body keys are overwritten.
pub(crate) fn merge_provider_options(
    body: &mut serde_json::Value,
    options: Option<&serde_json::Map<String, serde_json::Value>>,
) {
    if let (Some(options), Some(obj)) = (options, body.as_object_mut()) {
        for (key, value) in options {
            obj.insert(key.clone(), value.clone());
        }
    }
}
