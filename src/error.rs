//! Errors surfaced by the tracing client.

use thiserror::Error;

/// Result type returned by fallible tracing operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors raised while configuring the client or shipping trace data.
///
/// Construction-time problems are reported synchronously as
/// [`InvalidConfiguration`](TraceError::InvalidConfiguration). Upload
/// problems happen on a background task; they are logged and dropped unless
/// a caller opted into them through
/// [`Span::finish_wait`](crate::trace::Span::finish_wait).
///
/// The type is `Clone` so a single terminal upload result can be delivered
/// to every waiter of the affected bundle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceError {
    /// A client or sampler was built from invalid arguments.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The transport or the backend rejected an upload.
    #[error("trace upload failed: {0}")]
    UploadFailed(String),

    /// Pending trace data would exceed the buffered byte limit; the
    /// submission was dropped.
    #[error("buffered trace data exceeds the configured byte limit")]
    BufferFull,
}
