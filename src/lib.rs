//! PAKT: symmetric peer-to-peer RPC over any ordered, reliable byte
//! stream.
//!
//! Each endpoint of a connection is both caller and callee: either side
//! registers named functions and invokes the functions of the other side,
//! receiving a typed reply or an error, all multiplexed over the single
//! stream. The crate consumes an already-established bidirectional stream
//! (TCP, TLS over TCP, an in-memory duplex, ...) and adds framing,
//! call correlation, keep-alive and a graceful-close protocol on top.
//!
//! # Wire protocol
//!
//! Every frame starts with a fixed 8-byte prefix, integers big-endian:
//!
//! | Offset | Field       | Meaning                         |
//! |--------|-------------|---------------------------------|
//! | 0      | version     | protocol version, currently 0   |
//! | 1      | type        | frame type, see below           |
//! | 2..4   | header len  | length of the header bytes, u16 |
//! | 4..8   | payload len | length of the payload bytes, u32|
//!
//! followed by the codec-encoded header and payload. Frame types:
//!
//! | Value | Type        | Carries                                      |
//! |-------|-------------|----------------------------------------------|
//! | `0x0` | close       | nothing                                      |
//! | `0x1` | ping        | nothing                                      |
//! | `0x2` | pong        | nothing                                      |
//! | `0x3` | call        | function name + return key, call arguments   |
//! | `0x4` | call-return | return key + error text, reply value         |
//!
//! A call frame names the peer function to invoke and a random correlation
//! key; the matching call-return frame echoes the key so concurrent calls
//! multiplex freely. Replies are correlated by key, never by order.
//!
//! Headers and payloads are opaque to the framing layer; the [`Codec`]
//! seam (msgpack by default) encodes both. Payloads are capped at a
//! configurable maximum (100 KiB by default), headers at a 10 KiB hard
//! limit; violations on the inbound path close the connection.
//!
//! # Keep-alive
//!
//! A socket pings its peer after 30 s of silence and closes the connection
//! after 45 s without any inbound frame. Any received frame resets both
//! timers, so an active connection never pings.
//!
//! # Example
//!
//! ```no_run
//! use pakt::tcp;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let socket = tcp::connect("127.0.0.1:42193").await?;
//!
//!     socket.register_func("greet", |ctx: pakt::Context| async move {
//!         let name: String = ctx.decode()?;
//!         Ok(format!("Hello {name}"))
//!     });
//!     socket.ready();
//!
//!     let reply = socket.call("add", &(40, 2)).await?;
//!     let sum: i64 = reply.decode()?;
//!     println!("sum: {sum}");
//!     Ok(())
//! }
//! ```

mod chain;
mod codec;
mod context;
mod error;
mod frame;
mod keepalive;
mod server;
mod socket;
pub mod tcp;

pub use codec::{Codec, MsgPack};
pub use context::Context;
pub use error::Error;
pub use frame::{DEFAULT_MAX_MESSAGE_SIZE, MAX_HEADER_SIZE, VERSION};
pub use server::{Accept, Server, ServerOptions};
pub use socket::{Handler, HandlerFuture, Socket, DEFAULT_CALL_TIMEOUT};
