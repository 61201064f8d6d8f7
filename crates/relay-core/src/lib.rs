//! Core types and error definitions for the relay model router.
//!
//! This crate provides the vocabulary shared between the router and its
//! callers: the error taxonomy, the vendor-neutral request and response
//! types, and the streaming chunk type.
//!
//! # Main types
//!
//! - [`RelayError`] — Unified error enum for routing failures.
//! - [`RelayResult`] — Convenience alias for `Result<T, RelayError>`.
//! - [`ChatRequest`] — A normalized request, including its cancellation token.
//! - [`ChatCompletion`] — A normalized, vendor-independent response.
//! - [`StreamEvent`] — One chunk of a streamed response.

/// Error taxonomy and result alias.
pub mod error;
/// Conversation messages and roles.
pub mod message;
/// The vendor-neutral request.
pub mod request;
/// Completed responses and token usage.
pub mod response;
/// Streaming chunk types.
pub mod stream;
/// Tool definitions offered to the model.
pub mod tool;

pub use error::{RelayError, RelayResult};
pub use message::{Message, Role};
pub use request::{ChatRequest, ProviderOptions, RequestShape};
pub use response::{ChatCompletion, ContentBlock, FinishReason, Usage};
pub use stream::{ChunkStream, StreamEvent};
pub use tool::{ToolChoice, ToolDefinition};
pub use tokio_util::sync::CancellationToken;
