//! Model invocation router.
//!
//! A [`ModelRouter`] takes one logical [`ChatRequest`](relay_core::ChatRequest)
//! and tries the configured backends in the order given by an
//! [`AttemptPlan`] until one succeeds. Streaming calls are health-checked on
//! their first output chunk before they are handed to the caller as a
//! [`StreamHandle`].
//!
//! # Main types
//!
//! - [`ModelRouter`] — Non-streaming and streaming entry points.
//! - [`BackendConfig`] — One named route to a model, with credentials and defaults.
//! - [`Vendor`] — Wire dialect of a backend, or a pass-through client.
//! - [`LlmBackend`] — The live-client trait implemented per vendor dialect.
//! - [`RelayConfig`] — TOML configuration that builds a router.

/// Live vendor clients and the trait they implement.
pub mod backends;
/// TOML configuration.
pub mod config;
/// Attempt ordering.
pub mod plan;
/// Named backend configurations and their resolution into clients.
pub mod registry;
/// The router itself.
pub mod router;
/// Per-attempt cancellation and stream replay.
pub mod stream;
/// Vendor dialects and client construction.
pub mod vendor;

pub use backends::anthropic::AnthropicBackend;
pub use backends::openai::{OpenAiBackend, OpenAiDialect};
pub use backends::{ClientSettings, LlmBackend};
pub use config::{BackendEntry, RelayConfig, RouterSection};
pub use plan::AttemptPlan;
pub use registry::{
    BackendConfig, BackendOptions, BackendRegistry, RequestTransform, Resolvable, ResolvedBackend,
    DEFAULT_BACKEND,
};
pub use router::{ChatResponse, ModelRouter, RouterSettings, StreamHandle};
pub use stream::AttemptScope;
pub use vendor::Vendor;
