use crate::message::Message;
use crate::tool::{ToolChoice, ToolDefinition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Vendor-specific request fields, grouped by vendor key (`"openai"`, `"anthropic"`, ...).
pub type ProviderOptions = BTreeMap<String, serde_json::Map<String, serde_json::Value>>;

/// A vendor-neutral chat request.
///
/// The router clones this once per attempt and only fills in fields the
/// caller left empty (max output tokens, sampling defaults, the provider
/// option namespace of the serving vendor).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Optional system prompt, sent in whatever slot the vendor expects.
    pub system: Option<String>,
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Constraint on tool use; vendor default when `None`.
    pub tool_choice: Option<ToolChoice>,
    /// Output token cap. Filled from backend or router defaults when unset.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    pub top_p: Option<f32>,
    /// Top-k sampling. Dropped by dialects that do not accept it.
    pub top_k: Option<u32>,
    /// Stop sequences.
    pub stop: Vec<String>,
    /// Extra body fields per vendor key. Only the serving vendor's entry is sent.
    pub provider_options: ProviderOptions,
    /// Cancelling this token aborts the whole routed operation.
    pub cancel: CancellationToken,
}

impl ChatRequest {
    /// Creates a request holding the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the maximum number of output tokens.
    #[must_use]
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// Uses the given cancellation token for this request.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the provider options for `vendor`, if any were supplied.
    pub fn options_for(&self, vendor: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.provider_options.get(vendor)
    }

    /// Summarizes the request for diagnostics without message bodies.
    pub fn shape(&self) -> RequestShape {
        RequestShape {
            messages: self.messages.len(),
            has_system: self.system.is_some(),
            tools: self.tools.iter().map(|t| t.name.clone()).collect(),
            tool_choice: self.tool_choice.clone(),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop_sequences: self.stop.len(),
            provider_options: self.provider_options.keys().cloned().collect(),
        }
    }
}

/// Secret-free summary of a [`ChatRequest`], logged when an attempt fails.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestShape {
    /// Number of messages.
    pub messages: usize,
    /// Whether a system prompt was set.
    pub has_system: bool,
    /// Names of the offered tools.
    pub tools: Vec<String>,
    /// Requested tool choice.
    pub tool_choice: Option<ToolChoice>,
    /// Effective output token cap.
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling mass.
    pub top_p: Option<f32>,
    /// Top-k sampling.
    pub top_k: Option<u32>,
    /// Number of stop sequences.
    pub stop_sequences: usize,
    /// Vendor keys present in the provider options.
    pub provider_options: Vec<String>,
}

impl fmt::Display for RequestShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}
