//! Stable error kinds observable through the public API.

use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by socket and server operations.
///
/// A call returns exactly one of: success, [`Error::Timeout`],
/// [`Error::Closed`], [`Error::MaxMessageSizeExceeded`], or
/// [`Error::Remote`] carrying the peer's error text.
#[derive(Debug, Error)]
pub enum Error {
    /// The per-call deadline expired before the reply arrived.
    #[error("timeout")]
    Timeout,

    /// The connection closed while waiting for a reply, or the socket was
    /// already closed when the operation started.
    #[error("socket closed")]
    Closed,

    /// The encoded payload exceeds the configured maximum message size.
    /// Nothing was transmitted.
    #[error("maximum message size exceeded")]
    MaxMessageSizeExceeded,

    /// The encoded header exceeds the 10 KiB hard cap.
    #[error("maximum header size exceeded")]
    HeaderTooLarge,

    /// [`Context::decode`](crate::Context::decode) was invoked on a
    /// message that carried no payload.
    #[error("no context data available to decode")]
    NoContextData,

    /// The peer's handler reported an error. Only the error text crosses
    /// the wire; `data` holds the still-encoded reply payload, which the
    /// caller may decode or ignore.
    #[error("{message}")]
    Remote { message: String, data: Bytes },

    /// Encoding or decoding through the codec failed.
    #[error("codec: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
