//! Pluggable serialization seam.
//!
//! A codec turns header structs and user payloads into bytes and back; one
//! codec serves both roles for a given socket. The default [`MsgPack`]
//! codec speaks self-describing msgpack via serde. Any implementation of
//! [`Codec`] substitutes at the type level.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Serialization strategy of a socket.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Encode `value` to bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Error>;

    /// Decode `data` into a `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, Error>;

    /// Whether `data` represents "no value" in this format. Drives the
    /// [`Error::NoContextData`] check in
    /// [`Context::decode`](crate::Context::decode).
    fn is_empty_value(&self, data: &[u8]) -> bool {
        data.is_empty()
    }
}

const MSGPACK_NIL: u8 = 0xc0;

/// Self-describing msgpack codec, the default for sockets and servers.
///
/// Structs are encoded with their field names so either peer can evolve
/// independently of field order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPack;

impl Codec for MsgPack {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Codec(e.into()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, Error> {
        rmp_serde::from_slice(data).map_err(|e| Error::Codec(e.into()))
    }

    fn is_empty_value(&self, data: &[u8]) -> bool {
        data.is_empty() || (data.len() == 1 && data[0] == MSGPACK_NIL)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Named {
        name: String,
        count: u64,
    }

    #[test]
    fn round_trips_named_struct() {
        let value = Named {
            name: "test".into(),
            count: 42,
        };
        let encoded = MsgPack.encode(&value).unwrap();
        let decoded: Named = MsgPack.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unit_encodes_as_empty_value() {
        let encoded = MsgPack.encode(&()).unwrap();
        assert!(MsgPack.is_empty_value(&encoded));
        assert!(MsgPack.is_empty_value(&[]));
        assert!(!MsgPack.is_empty_value(&[0x01]));
    }
}
