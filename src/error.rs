use std::io;

/// Error type produced by a failed `writelines` producer.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Item yielded by a `writelines` producer: either the next buffer to
/// send, or the error that ends the producer.
pub type ProducerItem = Result<Vec<u8>, ProducerError>;

/// Errors surfaced at the crate boundary.
///
/// Failures inside the selector loop are not raised out of framework
/// methods; they are delivered through the handler protocol
/// (`failed_connect`, `handle_exception`, `handle_close`). This type
/// covers the calls an application makes directly.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An outbound connect was refused, reported with the errno name or
    /// OS error string.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A `wait` deadline elapsed before the reactor drained.
    #[error("timed out waiting for the reactor to finish")]
    Timeout,

    /// A write-side operation was attempted on a closed connection.
    #[error("connection is closed")]
    Closed,

    /// `set_handler` was called on a connection that already has one.
    #[error("handler already set")]
    HandlerAlreadySet,

    /// A `writelines` producer failed; delivered through
    /// `handle_exception` before the connection is closed.
    #[error("write producer failed: {0}")]
    Producer(#[source] ProducerError),

    /// A response finished without matching the caller's expectation.
    #[error("unexpected response ({} bytes)", .0.len())]
    UnexpectedResponse(Vec<u8>),

    #[error(transparent)]
    Io(#[from] io::Error),
}
