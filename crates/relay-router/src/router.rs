use crate::plan::AttemptPlan;
use crate::registry::{BackendConfig, BackendRegistry, ResolvedBackend};
use crate::stream::{replay, AttemptScope};
use futures_util::{Stream, StreamExt};
use relay_core::{
    CancellationToken, ChatCompletion, ChatRequest, ChunkStream, ContentBlock, FinishReason,
    RelayError, RelayResult, StreamEvent, Usage,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Router-wide defaults, injected at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    /// Used when neither the call nor the backend sets `max_output_tokens`.
    pub default_max_output_tokens: Option<u32>,
    /// Bound on dispatch plus the first output chunk of a streamed attempt.
    pub stream_first_timeout: Duration,
    /// Bound on the gap between chunks once a stream is accepted.
    pub stream_token_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            default_max_output_tokens: Some(4096),
            stream_first_timeout: Duration::from_secs(30),
            stream_token_timeout: Duration::from_secs(180),
        }
    }
}

/// Result of a successful [`ModelRouter::call`].
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Name of the backend that served the call.
    pub backend: String,
    /// Configuration of the serving backend.
    pub config: Arc<BackendConfig>,
    /// First text block, if any.
    pub text: Option<String>,
    /// All output blocks.
    pub content: Vec<ContentBlock>,
    /// Normalized stop reason.
    pub finish_reason: FinishReason,
    /// Token accounting.
    pub usage: Usage,
    /// Body sent to the vendor.
    pub raw_request: serde_json::Value,
    /// Body received from the vendor.
    pub raw_response: serde_json::Value,
}

impl ChatResponse {
    fn new(backend: &ResolvedBackend, completion: ChatCompletion) -> Self {
        Self {
            backend: backend.name().to_string(),
            config: Arc::clone(&backend.config),
            text: completion.first_text().map(str::to_string),
            content: completion.content,
            finish_reason: completion.finish_reason,
            usage: completion.usage,
            raw_request: completion.raw_request,
            raw_response: completion.raw_response,
        }
    }
}

/// An accepted stream, tagged with the backend that serves it.
///
/// Yields the chunks read during the health check first, then the rest of the
/// source. Single consumer; dropping the handle cancels the underlying attempt.
pub struct StreamHandle {
    /// Name of the backend serving the stream.
    pub backend: String,
    /// Configuration of the serving backend.
    pub config: Arc<BackendConfig>,
    /// The request exactly as dispatched, after defaults and transforms.
    pub request: ChatRequest,
    chunks: ChunkStream,
}

impl StreamHandle {
    /// Drains the stream and concatenates its text deltas.
    ///
    /// An in-band error chunk or a stream error ends collection with an error.
    pub async fn collect_text(mut self) -> RelayResult<String> {
        let mut text = String::new();
        while let Some(event) = self.chunks.next().await {
            match event? {
                StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
                StreamEvent::Error { message } => return Err(RelayError::Backend(message)),
                _ => {}
            }
        }
        Ok(text)
    }
}

impl Stream for StreamHandle {
    type Item = RelayResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("request", &self.request.shape())
            .finish_non_exhaustive()
    }
}

/// Routes one logical request across the configured backends.
///
/// Attempts run strictly one after another following an [`AttemptPlan`]. The
/// first success wins; cancellation ends the call immediately; any other
/// failure is logged and the next planned backend is tried.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    registry: Arc<BackendRegistry>,
    settings: RouterSettings,
}

impl ModelRouter {
    /// Builds a router over `backends`; one of them must be named `default`.
    pub fn new(backends: Vec<BackendConfig>, settings: RouterSettings) -> RelayResult<Self> {
        Ok(Self::from_registry(BackendRegistry::new(backends)?, settings))
    }

    /// Builds a router over an existing registry.
    pub fn from_registry(registry: BackendRegistry, settings: RouterSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            settings,
        }
    }

    /// The backends this router dispatches to.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Router-wide defaults.
    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// The attempt order a call with these preferences would follow.
    pub fn plan<S: AsRef<str>>(&self, preferred: &[S]) -> AttemptPlan {
        AttemptPlan::new(preferred)
    }

    /// Non-streaming call; fails only once every planned attempt failed.
    pub async fn call<S: AsRef<str>>(
        &self,
        preferred: &[S],
        request: &ChatRequest,
    ) -> RelayResult<ChatResponse> {
        let plan = self.plan(preferred);
        let span = info_span!("relay_call", request_id = %Uuid::new_v4(), stream = false);
        self.run_call(plan, request).instrument(span).await
    }

    /// Streaming call. Each attempt must deliver a usable first chunk within
    /// `stream_first_timeout` before it is handed to the caller.
    pub async fn call_stream<S: AsRef<str>>(
        &self,
        preferred: &[S],
        request: &ChatRequest,
    ) -> RelayResult<StreamHandle> {
        let plan = self.plan(preferred);
        let span = info_span!("relay_call", request_id = %Uuid::new_v4(), stream = true);
        self.run_stream(plan, request).instrument(span).await
    }

    async fn run_call(&self, plan: AttemptPlan, request: &ChatRequest) -> RelayResult<ChatResponse> {
        let mut last_err: Option<RelayError> = None;

        for (attempt, name) in plan.iter().enumerate() {
            let Some(backend) = self.resolve(name, attempt, request, &mut last_err).await? else {
                continue;
            };

            let scope = AttemptScope::new(&request.cancel);
            let prepared = self.prepare(&backend, request, scope.token().clone());
            let result = until_cancelled(&request.cancel, backend.client.chat(&prepared)).await;

            match result {
                Ok(completion) => {
                    info!(
                        backend = %backend.name(),
                        vendor = %backend.vendor(),
                        attempt,
                        "Call served"
                    );
                    return Ok(ChatResponse::new(&backend, completion));
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    log_failure(&backend, attempt, &prepared, &e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(RelayError::NoBackendAvailable))
    }

    async fn run_stream(
        &self,
        plan: AttemptPlan,
        request: &ChatRequest,
    ) -> RelayResult<StreamHandle> {
        let mut last_err: Option<RelayError> = None;
        let first_timeout = self.settings.stream_first_timeout;

        for (attempt, name) in plan.iter().enumerate() {
            let Some(backend) = self.resolve(name, attempt, request, &mut last_err).await? else {
                continue;
            };

            let scope = AttemptScope::new(&request.cancel);
            let prepared = self.prepare(&backend, request, scope.token().clone());

            let timed = async {
                tokio::time::timeout(first_timeout, first_output(&backend, &prepared))
                    .await
                    .map_err(|_| {
                        RelayError::Timeout(format!("no first chunk within {first_timeout:?}"))
                    })?
            };

            let failure = match until_cancelled(&request.cancel, timed).await {
                Ok((chunks, prefix)) => {
                    info!(
                        backend = %backend.name(),
                        vendor = %backend.vendor(),
                        attempt,
                        "Stream accepted"
                    );
                    let chunks = replay(prefix, chunks, self.settings.stream_token_timeout, scope);
                    return Ok(StreamHandle {
                        backend: backend.name().to_string(),
                        config: Arc::clone(&backend.config),
                        request: prepared,
                        chunks,
                    });
                }
                Err(e) => e,
            };

            if failure.is_cancellation() {
                return Err(failure);
            }
            scope.cancel();
            log_failure(&backend, attempt, &prepared, &failure);
            last_err = Some(failure);
        }

        Err(last_err.unwrap_or(RelayError::NoBackendAvailable))
    }

    /// Resolves one planned name. `Ok(None)` means "skip": the name is unknown
    /// or resolution failed (recorded in `last_err`). Only cancellation is
    /// returned as an error.
    async fn resolve(
        &self,
        name: &str,
        attempt: usize,
        request: &ChatRequest,
        last_err: &mut Option<RelayError>,
    ) -> RelayResult<Option<ResolvedBackend>> {
        match until_cancelled(&request.cancel, self.registry.resolve(name)).await {
            Ok(Some(backend)) => Ok(Some(backend)),
            Ok(None) => {
                debug!(backend = name, attempt, "Unknown backend, skipping");
                Ok(None)
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(
                    backend = name,
                    attempt,
                    error = %e,
                    request = %request.shape(),
                    "Backend resolution failed"
                );
                *last_err = Some(e);
                Ok(None)
            }
        }
    }

    /// Layers backend and router defaults under the caller's request, then
    /// applies the backend's transform hook.
    fn prepare(
        &self,
        backend: &ResolvedBackend,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> ChatRequest {
        let config = &backend.config;
        let options = &config.options;
        let mut prepared = request.clone();
        prepared.cancel = cancel;

        prepared.max_output_tokens = request
            .max_output_tokens
            .or(options.max_output_tokens)
            .or(self.settings.default_max_output_tokens);
        prepared.temperature = request.temperature.or(options.temperature);
        prepared.top_p = request.top_p.or(options.top_p);
        prepared.top_k = request.top_k.or(options.top_k);

        if !options.extra.is_empty() {
            let namespace = prepared
                .provider_options
                .entry(backend.vendor().to_string())
                .or_default();
            for (key, value) in &options.extra {
                namespace.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        if let Some(transform) = &config.request_transform {
            transform(&mut prepared);
        }
        prepared
    }
}

/// Races `fut` against the caller's token.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = RelayResult<T>>,
) -> RelayResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RelayError::Cancelled),
        result = fut => result,
    }
}

/// Dispatches a streaming attempt and reads until the first output chunk.
///
/// Leading metadata (usage, finish) is kept in the returned prefix so the
/// caller still sees it. A stream that ends before any output, or whose first
/// non-metadata chunk is an in-band error, is a failed attempt.
async fn first_output(
    backend: &ResolvedBackend,
    request: &ChatRequest,
) -> RelayResult<(ChunkStream, Vec<StreamEvent>)> {
    let mut chunks = backend.client.chat_stream(request).await?;
    let mut prefix = Vec::new();
    loop {
        match chunks.next().await {
            Some(Ok(StreamEvent::Error { message })) => return Err(RelayError::Backend(message)),
            Some(Ok(event)) => {
                let output = event.is_output();
                prefix.push(event);
                if output {
                    return Ok((chunks, prefix));
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Err(RelayError::EmptyStream),
        }
    }
}

fn log_failure(backend: &ResolvedBackend, attempt: usize, request: &ChatRequest, error: &RelayError) {
    warn!(
        backend = %backend.name(),
        vendor = %backend.vendor(),
        model = %backend.config.model,
        attempt,
        error = %error,
        request = %request.shape(),
        "Backend attempt failed"
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────
