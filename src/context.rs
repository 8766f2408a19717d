//! Per-message context handed to handlers and returned from calls.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::{Codec, MsgPack};
use crate::error::Error;
use crate::socket::Socket;

/// One received message: the socket it arrived on plus the still-encoded
/// payload bytes. Decoding is lazy; handlers that expect no input never
/// touch the payload.
pub struct Context<C: Codec = MsgPack> {
    socket: Arc<Socket<C>>,
    data: Bytes,
}

impl<C: Codec> std::fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("data", &self.data)
            .finish()
    }
}

impl<C: Codec> Context<C> {
    pub(crate) fn new(socket: Arc<Socket<C>>, data: Bytes) -> Self {
        Self { socket, data }
    }

    /// The socket this message arrived on.
    pub fn socket(&self) -> &Arc<Socket<C>> {
        &self.socket
    }

    /// Raw, still-encoded payload bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode the payload into a `T` through the socket's codec.
    ///
    /// Fails with [`Error::NoContextData`] when the message carried no
    /// payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        if self.socket.codec().is_empty_value(&self.data) {
            return Err(Error::NoContextData);
        }
        self.socket.codec().decode(&self.data)
    }
}
