use serde::{Deserialize, Serialize};

/// One block of model output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text {
        /// The generated text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Vendor-assigned call id.
        id: String,
        /// Name of the tool to call.
        name: String,
        /// Parsed call arguments.
        input: serde_json::Value,
    },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the turn or a stop sequence.
    #[default]
    Stop,
    /// The output token cap was reached.
    Length,
    /// The model is waiting on tool results.
    ToolCalls,
    /// Output was withheld by the vendor's content filter.
    ContentFilter,
    /// A vendor-specific reason with no normalized equivalent.
    Other(String),
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Generated tokens.
    pub output_tokens: u64,
}

impl Usage {
    /// Input plus output tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed, vendor-normalized response from one backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletion {
    /// Output blocks in the order the vendor returned them.
    pub content: Vec<ContentBlock>,
    /// Normalized stop reason.
    pub finish_reason: FinishReason,
    /// Token accounting for this call.
    pub usage: Usage,
    /// The request body that was sent, kept for diagnostics.
    #[serde(default)]
    pub raw_request: serde_json::Value,
    /// The response body as received.
    #[serde(default)]
    pub raw_response: serde_json::Value,
}

impl ChatCompletion {
    /// Returns the first text block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::ToolUse { .. } => None,
        })
    }
}
