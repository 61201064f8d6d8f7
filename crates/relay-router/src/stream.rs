//! Per-attempt cancellation scopes and the replay wrapper handed to callers
//! of [`ModelRouter::call_stream`](crate::ModelRouter::call_stream).

use futures_util::stream::{self, StreamExt};
use relay_core::{CancellationToken, ChunkStream, RelayError, RelayResult, StreamEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::DropGuard;
use tracing::warn;

/// Cancellation context owned by exactly one attempt.
///
/// The token is a child of the caller's token, so it fires when the caller
/// cancels *or* when the attempt is torn down internally. Dropping the scope
/// cancels it, which stops any reader task still attached to the attempt.
#[derive(Debug)]
pub struct AttemptScope {
    token: CancellationToken,
    _guard: DropGuard,
}

impl AttemptScope {
    /// Opens a scope under the caller's token.
    pub fn new(parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let guard = token.clone().drop_guard();
        Self {
            token,
            _guard: guard,
        }
    }

    /// The attempt's token, handed to the backend.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tears down this attempt without touching the caller's token.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

struct Replay {
    prefix: VecDeque<StreamEvent>,
    source: Option<ChunkStream>,
    token_timeout: Duration,
    scope: AttemptScope,
}

enum Pull {
    Cancelled,
    Read(Result<Option<RelayResult<StreamEvent>>, tokio::time::error::Elapsed>),
}

/// Re-emits `prefix` and then continues pulling from `source`.
///
/// Each pull from `source` must complete within `token_timeout`; otherwise
/// the attempt is cancelled and the stream ends with [`RelayError::Timeout`].
/// A read error or caller cancellation also ends the stream after yielding
/// the error. The scope lives as long as the returned stream.
pub fn replay(
    prefix: Vec<StreamEvent>,
    source: ChunkStream,
    token_timeout: Duration,
    scope: AttemptScope,
) -> ChunkStream {
    let state = Replay {
        prefix: prefix.into(),
        source: Some(source),
        token_timeout,
        scope,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if let Some(event) = state.prefix.pop_front() {
            return Some((Ok(event), state));
        }

        let source = state.source.as_mut()?;
        let pulled = tokio::select! {
            biased;
            _ = state.scope.token.cancelled() => Pull::Cancelled,
            next = tokio::time::timeout(state.token_timeout, source.next()) => Pull::Read(next),
        };

        match pulled {
            Pull::Read(Ok(Some(Ok(event)))) => Some((Ok(event), state)),
            Pull::Read(Ok(None)) => {
                state.source = None;
                None
            }
            Pull::Read(Ok(Some(Err(e)))) => {
                state.source = None;
                Some((Err(e), state))
            }
            Pull::Read(Err(_)) => {
                warn!(
                    timeout_ms = state.token_timeout.as_millis() as u64,
                    "Stream stalled after acceptance, aborting"
                );
                state.source = None;
                state.scope.cancel();
                let err = RelayError::Timeout(format!(
                    "no chunk received within {:?}",
                    state.token_timeout
                ));
                Some((Err(err), state))
            }
            Pull::Cancelled => {
                state.source = None;
                Some((Err(RelayError::Cancelled), state))
            }
        }
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn text(t: &str) -> StreamEvent {
        StreamEvent::TextDelta { text: t.into() }
    }

    fn source(events: Vec<RelayResult<StreamEvent>>) -> ChunkStream {
        Box::pin(stream::iter(events))
    }

    #[tokio::test]
    async fn test_prefix_then_source_in_order() {
        let scope = AttemptScope::new(&CancellationToken::new());
        let out: Vec<_> = replay(
            vec![text("a")],
            source(vec![Ok(text("b")), Ok(text("c"))]),
            Duration::from_secs(1),
            scope,
        )
        .collect()
        .await;

        let events: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(events, vec![text("a"), text("b"), text("c")]);
    }

    #[tokio::test]
    async fn test_read_error_ends_stream() {
        let scope = AttemptScope::new(&CancellationToken::new());
        let out: Vec<_> = replay(
            vec![text("a")],
            source(vec![
                Err(RelayError::Stream("reset".into())),
                Ok(text("never")),
            ]),
            Duration::from_secs(1),
            scope,
        )
        .collect()
        .await;

        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(RelayError::Stream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_times_out_and_cancels_scope() {
        let scope = AttemptScope::new(&CancellationToken::new());
        let attempt_token = scope.token().clone();
        let stalled: ChunkStream = Box::pin(stream::pending());

        let mut out = replay(vec![text("a")], stalled, Duration::from_secs(180), scope);
        assert_eq!(out.next().await.unwrap().unwrap(), text("a"));
        let err = out.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)), "got: {err}");
        assert!(attempt_token.is_cancelled());
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_caller_cancel_terminates_stream() {
        let caller = CancellationToken::new();
        let scope = AttemptScope::new(&caller);
        let stalled: ChunkStream = Box::pin(stream::pending());

        let mut out = replay(Vec::new(), stalled, Duration::from_secs(180), scope);
        caller.cancel();
        let err = out.next().await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert!(out.next().await.is_none());
    }

    #[test]
    fn test_dropping_scope_cancels_only_the_attempt() {
        let caller = CancellationToken::new();
        let scope = AttemptScope::new(&caller);
        let attempt_token = scope.token().clone();
        drop(scope);
        assert!(attempt_token.is_cancelled());
        assert!(!caller.is_cancelled());
    }
}
