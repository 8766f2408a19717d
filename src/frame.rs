//! The length-framed wire protocol.
//!
//! Every frame starts with a fixed 8-byte prefix, all integers big-endian:
//!
//! | Offset | Field       | Type |
//! |--------|-------------|------|
//! | 0      | version     | u8   |
//! | 1      | frame type  | u8   |
//! | 2..4   | header len  | u16  |
//! | 4..8   | payload len | u32  |
//!
//! The header and payload that follow are codec-encoded and opaque to this
//! layer. Close, ping and pong frames carry neither.

use serde::{Deserialize, Serialize};

/// Protocol version emitted and accepted. Any other value on the wire is a
/// fail-close condition.
pub const VERSION: u8 = 0;

/// Size of the fixed frame prefix in bytes.
pub const PREFIX_SIZE: usize = 8;

/// Hard cap on the encoded header, independent of socket configuration.
pub const MAX_HEADER_SIZE: usize = 10 * 1024;

/// Default cap on the encoded payload; adjustable per socket.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameType {
    Close = 0x0,
    Ping = 0x1,
    Pong = 0x2,
    Call = 0x3,
    CallReturn = 0x4,
}

impl FrameType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Close),
            0x1 => Some(Self::Ping),
            0x2 => Some(Self::Pong),
            0x3 => Some(Self::Call),
            0x4 => Some(Self::CallReturn),
            _ => None,
        }
    }
}

/// Header of a `call` frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CallHeader {
    #[serde(rename = "FuncID")]
    pub func_id: String,
    #[serde(rename = "ReturnKey")]
    pub return_key: String,
}

/// Header of a `call-return` frame. An empty `return_err` means success.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReturnHeader {
    #[serde(rename = "ReturnKey")]
    pub return_key: String,
    #[serde(rename = "ReturnErr")]
    pub return_err: String,
}

/// Decoded form of the 8-byte prefix, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Prefix {
    pub version: u8,
    pub frame_type: u8,
    pub header_len: u16,
    pub payload_len: u32,
}

pub(crate) fn encode_prefix(
    frame_type: FrameType,
    header_len: u16,
    payload_len: u32,
) -> [u8; PREFIX_SIZE] {
    let mut prefix = [0u8; PREFIX_SIZE];
    prefix[0] = VERSION;
    prefix[1] = frame_type as u8;
    prefix[2..4].copy_from_slice(&header_len.to_be_bytes());
    prefix[4..8].copy_from_slice(&payload_len.to_be_bytes());
    prefix
}

pub(crate) fn decode_prefix(buf: &[u8; PREFIX_SIZE]) -> Prefix {
    Prefix {
        version: buf[0],
        frame_type: buf[1],
        header_len: u16::from_be_bytes([buf[2], buf[3]]),
        payload_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    }
}
