//! Server-sent-event framing shared by the HTTP backends.

use futures_util::StreamExt;
use relay_core::{CancellationToken, ChunkStream, RelayError, RelayResult, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Turns the `data:` payloads of one SSE response into [`StreamEvent`]s.
pub(crate) trait SseDecoder: Send + 'static {
    fn decode(&mut self, data: &str) -> Vec<StreamEvent>;

    /// Called once after the body ends.
    fn finish(&mut self) -> Vec<StreamEvent> {
        Vec::new()
    }
}

/// Splits a byte stream into SSE events and yields their data.
///
/// Bytes are buffered until a newline so multi-byte characters split across
/// network reads survive intact. Consecutive `data:` lines belong to one event
/// and are joined with `\n`; a blank line ends the event.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(data) = self.line(&String::from_utf8_lossy(&line)) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Ends the body: returns the data of an event that was not terminated by
    /// a blank line, including an unterminated last line.
    pub(crate) fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if !rest.is_empty() {
            self.line(&String::from_utf8_lossy(&rest));
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return self.dispatch();
        }
        // Comments and fields other than `data` carry nothing we decode.
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

/// Spawns a reader task that decodes `resp` into a chunk stream.
///
/// The task stops when `cancel` fires or when the returned stream is dropped,
/// releasing the HTTP body either way.
pub(crate) fn spawn_reader<D: SseDecoder>(
    resp: reqwest::Response,
    cancel: CancellationToken,
    mut decoder: D,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<RelayResult<StreamEvent>>(256);

    tokio::spawn(async move {
        let mut body = resp.bytes_stream();
        let mut buffer = SseBuffer::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("SSE reader cancelled");
                    return;
                }
                next = body.next() => next,
            };

            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let _ = tx
                        .send(Err(RelayError::Stream(format!("Stream read error: {e}"))))
                        .await;
                    return;
                }
                None => break,
            };

            for data in buffer.push(&bytes) {
                for event in decoder.decode(&data) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        }

        let tail = buffer
            .flush()
            .map(|data| decoder.decode(&data))
            .unwrap_or_default();
        for event in tail.into_iter().chain(decoder.finish()) {
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_reads() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(b"event: ping\nda").is_empty());
        let payloads = buffer.push(b"ta: {\"a\":1}\n\n: keep-alive\n\ndata:[DONE]\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_multi_line_data_is_joined() {
        let mut buffer = SseBuffer::default();
        let payloads = buffer.push(b"event: message\ndata: {\"a\":\ndata: 1}\r\n\r\ndata: next\n\n");
        assert_eq!(payloads, vec!["{\"a\":\n1}".to_string(), "next".to_string()]);
    }

    #[test]
    fn test_event_waits_for_blank_line() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(b"data: first\n").is_empty());
        assert_eq!(buffer.push(b"\n"), vec!["first".to_string()]);
    }

    #[test]
    fn test_multibyte_character_split_across_reads() {
        let mut buffer = SseBuffer::default();
        let event = "data: café\n\n".as_bytes();
        let split = event.len() - 3;
        assert!(buffer.push(&event[..split]).is_empty());
        assert_eq!(buffer.push(&event[split..]), vec!["café".to_string()]);
    }

    #[test]
    fn test_flush_returns_unterminated_event() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(b"data: a\ndata: tail").is_empty());
        assert_eq!(buffer.flush(), Some("a\ntail".to_string()));
        assert_eq!(buffer.flush(), None);
    }
}
