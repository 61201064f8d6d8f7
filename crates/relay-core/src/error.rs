use thiserror::Error;

/// A convenience `Result` alias using [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;

/// Error type shared by every relay crate.
///
/// Variants follow the router's failure taxonomy. Only [`RelayError::Cancelled`]
/// is never retried; everything raised before a stream is accepted is a
/// fallback trigger, and [`RelayError::Stream`] / [`RelayError::Timeout`]
/// raised by an accepted stream are terminal for that stream.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The caller's cancellation token fired.
    #[error("Request cancelled")]
    Cancelled,

    /// A backend configuration could not be turned into a live client.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Transport-level failure talking to a backend.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The backend answered with a non-success status.
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code returned by the vendor.
        status: u16,
        /// Response body or vendor error message.
        message: String,
    },

    /// The backend reported a failure inside an otherwise successful response.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A streaming call ended before producing any text or tool call.
    #[error("Stream ended before producing any output")]
    EmptyStream,

    /// A first-chunk or inter-chunk deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An accepted stream broke while being consumed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Every planned attempt was skipped before dispatch.
    #[error("No backend available")]
    NoBackendAvailable,

    /// Invalid router or backend configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error came from the caller cancelling the request.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}
