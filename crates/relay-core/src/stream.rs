use crate::error::RelayResult;
use crate::response::{FinishReason, Usage};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A pinned, boxed stream of chunks produced by a streaming backend call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = RelayResult<StreamEvent>> + Send>>;

/// Events emitted during a streaming LLM response.
///
/// Backends translate their wire events into this shape. An [`StreamEvent::Error`]
/// is the vendor reporting a failure inside a successful HTTP response; when it
/// is the first chunk of a stream the router falls back to the next backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of text content from the assistant.
    TextDelta {
        /// The text fragment.
        text: String,
    },

    /// A new tool call has started.
    ToolCallStart {
        /// Vendor-assigned call id.
        id: String,
        /// Name of the called tool.
        name: String,
    },

    /// An incremental fragment of tool call arguments (JSON string delta).
    ToolCallDelta {
        /// Id of the call being extended.
        id: String,
        /// Raw argument text to append.
        arguments_delta: String,
    },

    /// A tool call's arguments are now complete.
    ToolCallEnd {
        /// Id of the completed call.
        id: String,
    },

    /// Token usage reported so far.
    Usage {
        /// Counts reported by the vendor.
        usage: Usage,
    },

    /// The model finished generating.
    Finish {
        /// Normalized stop reason.
        reason: FinishReason,
    },

    /// The backend signalled an error in-band.
    Error {
        /// Vendor error message.
        message: String,
    },
}

impl StreamEvent {
    /// Whether this chunk is a vendor-reported error.
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }

    /// Whether this chunk carries model output (text or a tool call) rather
    /// than metadata such as usage or the finish reason.
    pub fn is_output(&self) -> bool {
        matches!(
            self,
            StreamEvent::TextDelta { .. }
                | StreamEvent::ToolCallStart { .. }
                | StreamEvent::ToolCallDelta { .. }
                | StreamEvent::ToolCallEnd { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_text_and_tool_chunks_are_output() {
        assert!(StreamEvent::TextDelta { text: "hi".into() }.is_output());
        assert!(StreamEvent::ToolCallEnd { id: "c1".into() }.is_output());
        assert!(!StreamEvent::Finish {
            reason: FinishReason::Stop
        }
        .is_output());
        assert!(!StreamEvent::Usage {
            usage: Usage::default()
        }
        .is_output());
        assert!(!StreamEvent::Error {
            message: "boom".into()
        }
        .is_output());
    }
}
