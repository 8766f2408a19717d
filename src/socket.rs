//! The socket engine: one end of a PAKT connection.
//!
//! A [`Socket`] wraps a single bidirectional byte stream and turns it into
//! a symmetric RPC endpoint. Both peers register named functions and call
//! the functions of the other side, multiplexed over the one stream and
//! correlated by per-call keys.
//!
//! # Architecture
//!
//! After [`ready`](Socket::ready) the following run concurrently:
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!                     │            Socket            │
//!                     ├──────────────────────────────┤
//!                     │  writer: Mutex<WriteHalf>    │
//!                     │  chain:  key -> oneshot      │
//!                     │  funcs:  name -> handler     │
//!                     └──────────────┬───────────────┘
//!                                    │
//!                                read loop
//!                                    │
//!          ┌─────────────────────────┼─────────────────────────┐
//!          │                         │                         │
//!    ping/pong/close        call-return (chain)          call (funcs)
//!          │                         │                         │
//!   ┌──────▼──────┐       ┌──────────▼─────────┐   ┌───────────▼──────────┐
//!   │ keep-alive, │       │ deliver to oneshot │   │ run handler on a     │
//!   │ lifecycle   │       │ waiter by key      │   │ spawned task, reply  │
//!   └─────────────┘       └────────────────────┘   └──────────────────────┘
//! ```
//!
//! Only the read loop reads from the stream; a single async mutex
//! serializes writers so every frame hits the wire whole.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{self, timeout};
use tokio_util::sync::CancellationToken;

use crate::chain::{Chain, ChainData};
use crate::codec::{Codec, MsgPack};
use crate::context::Context;
use crate::error::Error;
use crate::frame::{
    self, CallHeader, FrameType, ReturnHeader, DEFAULT_MAX_MESSAGE_SIZE, MAX_HEADER_SIZE,
    PREFIX_SIZE, VERSION,
};
use crate::keepalive;

/// Default deadline a call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// Strictly greater than the ping interval, so a responsive peer's pong
// always lands before the read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(40);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Future returned by a type-erased handler; resolves to the encoded
/// reply payload.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<u8>>> + Send>>;

/// A registered function in its type-erased, stored form. Produced by
/// [`Socket::handler`] and consumed by [`Socket::register_funcs`].
pub type Handler<C> = Arc<dyn Fn(Context<C>) -> HandlerFuture + Send + Sync>;

type CallHook<C> = Arc<dyn Fn(&Arc<Socket<C>>, &str, &Context<C>) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;
type CloseHook<C> = Box<dyn FnOnce(Arc<Socket<C>>) + Send>;

/// Everything the service tasks take ownership of when the socket goes
/// ready.
struct ReadyParts {
    reader: Reader,
    reset_timeout_rx: mpsc::Receiver<()>,
    reset_ping_rx: mpsc::Receiver<()>,
}

/// One end of a PAKT connection.
///
/// Construction binds the stream without starting I/O; call
/// [`ready`](Socket::ready) once all functions are registered.
pub struct Socket<C: Codec = MsgPack> {
    id: String,
    codec: C,

    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,

    ready_parts: Mutex<Option<ReadyParts>>,
    writer: AsyncMutex<Writer>,

    max_message_size: AtomicUsize,
    call_timeout: Mutex<Duration>,

    reset_timeout_tx: mpsc::Sender<()>,
    reset_ping_tx: mpsc::Sender<()>,

    close_token: CancellationToken,
    close_started: Mutex<bool>,
    on_close: Mutex<Vec<CloseHook<C>>>,

    funcs: Mutex<HashMap<String, Handler<C>>>,
    chain: Chain,

    call_hook: Mutex<Option<CallHook<C>>>,
    error_hook: Mutex<Option<ErrorHook>>,

    value: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Socket {
    /// Bind `stream` with the default msgpack codec and no identifier.
    pub fn new<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, MsgPack, String::new(), None, None)
    }

    /// Bind `stream` with the default msgpack codec and the given
    /// identifier.
    pub fn with_id<S>(stream: S, id: impl Into<String>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, MsgPack, id.into(), None, None)
    }

    /// Wrap an established TCP stream, recording both endpoint addresses.
    pub fn from_tcp(stream: TcpStream) -> Arc<Self> {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        Self::build(stream, MsgPack, String::new(), local_addr, remote_addr)
    }
}

impl<C: Codec> Socket<C> {
    /// Bind `stream` with a custom codec.
    pub fn with_codec<S>(stream: S, codec: C, id: impl Into<String>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, codec, id.into(), None, None)
    }

    pub(crate) fn build<S>(
        stream: S,
        codec: C,
        id: String,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (reset_timeout_tx, reset_timeout_rx) = mpsc::channel(1);
        let (reset_ping_tx, reset_ping_rx) = mpsc::channel(1);

        Arc::new(Self {
            id,
            codec,
            local_addr,
            remote_addr,
            ready_parts: Mutex::new(Some(ReadyParts {
                reader: Box::new(reader),
                reset_timeout_rx,
                reset_ping_rx,
            })),
            writer: AsyncMutex::new(Box::new(writer)),
            max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            call_timeout: Mutex::new(DEFAULT_CALL_TIMEOUT),
            reset_timeout_tx,
            reset_ping_tx,
            close_token: CancellationToken::new(),
            close_started: Mutex::new(false),
            on_close: Mutex::new(Vec::new()),
            funcs: Mutex::new(HashMap::new()),
            chain: Chain::new(),
            call_hook: Mutex::new(None),
            error_hook: Mutex::new(None),
            value: Mutex::new(None),
        })
    }

    /// Start the read loop, ping timer and idle watcher. Call once, after
    /// registering functions; a second call is a logged no-op.
    pub fn ready(self: &Arc<Self>) {
        let Some(parts) = self.ready_parts.lock().take() else {
            tracing::warn!(id = %self.id, "socket: ready called more than once");
            return;
        };

        tokio::spawn(self.clone().read_loop(parts.reader));
        tokio::spawn(keepalive::ping_loop(self.clone(), parts.reset_ping_rx));
        tokio::spawn(keepalive::timeout_loop(
            self.clone(),
            parts.reset_timeout_rx,
        ));
    }

    /// The socket identifier, or an empty string if none was assigned.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local address of the underlying stream, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the underlying stream, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    /// Cap the encoded payload size for both directions. Inbound frames
    /// above the cap are a protocol violation and close the socket.
    /// Values above `u32::MAX` are clamped; the wire advertises the
    /// payload length as a u32.
    pub fn set_max_message_size(&self, size: usize) {
        let size = size.min(u32::MAX as usize);
        self.max_message_size.store(size, Ordering::Relaxed);
    }

    /// Set the default deadline for [`call`](Socket::call).
    pub fn set_call_timeout(&self, timeout: Duration) {
        *self.call_timeout.lock() = timeout;
    }

    /// Hook invoked before every inbound call's handler runs.
    pub fn set_call_hook<F>(&self, hook: F)
    where
        F: Fn(&Arc<Socket<C>>, &str, &Context<C>) + Send + Sync + 'static,
    {
        *self.call_hook.lock() = Some(Arc::new(hook));
    }

    /// Hook invoked whenever a local handler returns an error; useful for
    /// logging. The peer receives the error text either way.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        *self.error_hook.lock() = Some(Arc::new(hook));
    }

    /// Attach an opaque user value to the socket.
    pub fn set_value<T: Any + Send + Sync>(&self, value: T) {
        *self.value.lock() = Some(Arc::new(value));
    }

    /// Retrieve the attached user value, if one of type `T` is present.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.value.lock().clone();
        value.and_then(|v| v.downcast::<T>().ok())
    }

    /// Register a remote-callable function under a unique name. Thread
    /// safe and additive; registering the same name again replaces the
    /// previous handler.
    pub fn register_func<F, Fut, T>(&self, id: impl Into<String>, f: F)
    where
        F: Fn(Context<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize,
    {
        let handler = self.handler(f);
        self.funcs.lock().insert(id.into(), handler);
    }

    /// Register a batch of type-erased handlers at once.
    pub fn register_funcs(&self, funcs: impl IntoIterator<Item = (String, Handler<C>)>) {
        let mut map = self.funcs.lock();
        for (id, handler) in funcs {
            map.insert(id, handler);
        }
    }

    /// Type-erase a handler for [`register_funcs`](Socket::register_funcs).
    /// The reply value is encoded through the socket's codec; an encoding
    /// failure is reported to the peer like any handler error.
    pub fn handler<F, Fut, T>(&self, f: F) -> Handler<C>
    where
        F: Fn(Context<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize,
    {
        let codec = self.codec.clone();
        let handler: Handler<C> = Arc::new(move |context| {
            let codec = codec.clone();
            let fut = f(context);
            Box::pin(async move {
                let value = fut.await?;
                Ok(codec.encode(&value)?)
            })
        });
        handler
    }

    /// Call the peer's function `func_id` and wait for its reply, with the
    /// socket's default call timeout.
    ///
    /// Pass `&()` for a call without arguments; the peer's
    /// [`Context::decode`] then reports [`Error::NoContextData`].
    pub async fn call<A: Serialize>(
        self: &Arc<Self>,
        func_id: &str,
        args: &A,
    ) -> Result<Context<C>, Error> {
        let call_timeout = *self.call_timeout.lock();
        self.call_with_timeout(func_id, args, call_timeout).await
    }

    /// Like [`call`](Socket::call) with an explicit per-call deadline.
    pub async fn call_with_timeout<A: Serialize>(
        self: &Arc<Self>,
        func_id: &str,
        args: &A,
        call_timeout: Duration,
    ) -> Result<Context<C>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let (key, slot) = self.chain.create();
        // Drop the registry entry on every exit path; removal is
        // idempotent against the dispatcher's `take`.
        let _guard = ChainGuard {
            chain: &self.chain,
            key: key.clone(),
        };

        let header = self.codec.encode(&CallHeader {
            func_id: func_id.to_owned(),
            return_key: key,
        })?;
        let payload = self.codec.encode(args)?;

        self.write_frame(FrameType::Call, Some(header), Some(payload))
            .await?;

        tokio::select! {
            delivered = slot => match delivered {
                Ok(ChainData { data, err: Some(message) }) => Err(Error::Remote { message, data }),
                Ok(ChainData { data, err: None }) => Ok(Context::new(self.clone(), data)),
                // Delivery slot vanished under us; the socket is going down.
                Err(_) => Err(Error::Closed),
            },
            _ = time::sleep(call_timeout) => Err(Error::Timeout),
            _ = self.close_token.cancelled() => Err(Error::Closed),
        }
    }

    /// Whether the close broadcast has fired.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// A token observing the close broadcast; `closed().cancelled().await`
    /// resolves once the socket closes.
    pub fn closed(&self) -> CancellationToken {
        self.close_token.clone()
    }

    /// Run `hook` once when the socket closes. May be called any number
    /// of times; every hook fires exactly once. A hook registered on an
    /// already-closed socket runs immediately.
    pub fn on_close<F>(self: &Arc<Self>, hook: F)
    where
        F: FnOnce(Arc<Socket<C>>) + Send + 'static,
    {
        {
            // The flag check and the push must be atomic with respect to
            // close(), which drains the hook list exactly once.
            let started = self.close_started.lock();
            if !*started {
                self.on_close.lock().push(Box::new(hook));
                return;
            }
        }

        hook(self.clone());
    }

    /// Close the socket. Idempotent and safe to call concurrently.
    ///
    /// Publishes the close broadcast (waking pending callers with
    /// [`Error::Closed`]), best-effort notifies the peer with a close
    /// frame, shuts the stream down and runs the on-close hooks.
    pub fn close(self: &Arc<Self>) {
        {
            let mut started = self.close_started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        self.close_token.cancel();

        // The close frame needs the write lock; send it from its own task
        // so close never nests the lifecycle and write locks.
        let socket = self.clone();
        tokio::spawn(async move {
            if let Err(err) = socket
                .write_frame_raw(FrameType::Close, None, None)
                .await
            {
                tracing::debug!(%err, "socket: close frame not delivered");
            }
            let mut writer = socket.writer.lock().await;
            let _ = writer.shutdown().await;
        });

        let hooks: Vec<CloseHook<C>> = std::mem::take(&mut *self.on_close.lock());
        for hook in hooks {
            hook(self.clone());
        }
    }

    fn max_message_size_now(&self) -> usize {
        self.max_message_size.load(Ordering::Relaxed)
    }

    pub(crate) async fn send_ping(self: &Arc<Self>) -> Result<(), Error> {
        self.write_frame(FrameType::Ping, None, None).await
    }

    async fn write_frame(
        self: &Arc<Self>,
        frame_type: FrameType,
        header: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.write_frame_raw(frame_type, header, payload).await
    }

    /// Emit one frame under the write lock. Bounds are enforced before any
    /// byte is transmitted; an I/O failure mid-frame would desynchronize
    /// the peer and closes the socket.
    async fn write_frame_raw(
        self: &Arc<Self>,
        frame_type: FrameType,
        header: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let header = header.unwrap_or_default();
        let payload = payload.unwrap_or_default();

        if payload.len() > self.max_message_size_now() {
            return Err(Error::MaxMessageSizeExceeded);
        }
        if header.len() > MAX_HEADER_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        let prefix = frame::encode_prefix(frame_type, header.len() as u16, payload.len() as u32);

        let mut writer = self.writer.lock().await;
        let written = timeout(WRITE_TIMEOUT, async {
            writer.write_all(&prefix).await?;
            if !header.is_empty() {
                writer.write_all(&header).await?;
            }
            if !payload.is_empty() {
                writer.write_all(&payload).await?;
            }
            writer.flush().await
        })
        .await;
        drop(writer);

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.close();
                Err(err.into())
            }
            Err(_elapsed) => {
                self.close();
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                )))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: Reader) {
        loop {
            let next = tokio::select! {
                _ = self.close_token.cancelled() => break,
                next = read_frame(&mut reader, self.max_message_size_now()) => next,
            };

            let frame = match next {
                Ok(frame) => frame,
                Err(err) => {
                    // EOF and post-close stream errors are expected
                    // teardown paths, not failures.
                    if !self.is_closed() && err.kind() != io::ErrorKind::UnexpectedEof {
                        tracing::warn!(%err, "socket: failed to read from the stream");
                    }
                    break;
                }
            };

            // Any complete frame proves peer liveness. A full channel
            // already carries a pending reset.
            let _ = self.reset_timeout_tx.try_send(());
            let _ = self.reset_ping_tx.try_send(());

            if frame.frame_type == FrameType::Close {
                break;
            }

            let socket = self.clone();
            tokio::spawn(async move {
                socket.handle_frame(frame).await;
            });
        }

        self.close();
    }

    async fn handle_frame(self: &Arc<Self>, frame: RawFrame) {
        match frame.frame_type {
            // Handled inline by the read loop.
            FrameType::Close => {}
            FrameType::Ping => {
                if let Err(err) = self.write_frame(FrameType::Pong, None, None).await {
                    tracing::warn!(%err, "socket: failed to send pong response");
                }
            }
            // Liveness was already registered by the read loop.
            FrameType::Pong => {}
            FrameType::CallReturn => self.handle_call_return(frame),
            FrameType::Call => self.handle_call(frame).await,
        }
    }

    fn handle_call_return(&self, frame: RawFrame) {
        let header: ReturnHeader = match self.codec.decode(&frame.header) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%err, "socket: failed to decode call-return header");
                return;
            }
        };

        let Some(slot) = self.chain.take(&header.return_key) else {
            tracing::warn!(
                return_key = %header.return_key,
                "socket: no caller awaiting this return key (call timeout exceeded?)"
            );
            return;
        };

        let err = (!header.return_err.is_empty()).then_some(header.return_err);
        if slot
            .send(ChainData {
                data: frame.payload,
                err,
            })
            .is_err()
        {
            tracing::warn!("socket: caller vanished before reply delivery");
        }
    }

    async fn handle_call(self: &Arc<Self>, frame: RawFrame) {
        let header: CallHeader = match self.codec.decode(&frame.header) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%err, "socket: failed to decode call header");
                return;
            }
        };

        let handler = self.funcs.lock().get(&header.func_id).cloned();
        let Some(handler) = handler else {
            tracing::warn!(
                func_id = %header.func_id,
                "socket: requested function does not exist"
            );
            return;
        };

        let context = Context::new(self.clone(), frame.payload);
        let call_hook = self.call_hook.lock().clone();
        if let Some(hook) = call_hook {
            hook(self, &header.func_id, &context);
        }

        let outcome = AssertUnwindSafe(handler(context)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    func_id = %header.func_id,
                    panic = panic_message(&panic),
                    "socket: handler panicked"
                );
                // No reply; the caller runs into its timeout.
                return;
            }
        };

        let (reply, handler_err) = match result {
            Ok(encoded) => (encoded, None),
            Err(err) => (self.codec.encode(&()).unwrap_or_default(), Some(err)),
        };

        let return_header = ReturnHeader {
            return_key: header.return_key,
            return_err: handler_err
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_default(),
        };
        let encoded_header = match self.codec.encode(&return_header) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(%err, "socket: failed to encode call-return header");
                return;
            }
        };

        if let Err(err) = self
            .write_frame(FrameType::CallReturn, Some(encoded_header), Some(reply))
            .await
        {
            tracing::warn!(
                %err,
                func_id = %header.func_id,
                "socket: failed to send return data"
            );
        }

        if let Some(err) = handler_err {
            let error_hook = self.error_hook.lock().clone();
            if let Some(hook) = error_hook {
                hook(&header.func_id, &err);
            }
        }
    }
}

struct ChainGuard<'a> {
    chain: &'a Chain,
    key: String,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        self.chain.remove(&self.key);
    }
}

/// One inbound frame, bounds-checked and split into its parts.
struct RawFrame {
    frame_type: FrameType,
    header: Bytes,
    payload: Bytes,
}

async fn read_frame(reader: &mut Reader, max_message_size: usize) -> io::Result<RawFrame> {
    let mut prefix = [0u8; PREFIX_SIZE];
    read_exact_deadline(reader, &mut prefix).await?;
    let prefix = frame::decode_prefix(&prefix);

    if prefix.version != VERSION {
        return Err(invalid_data(format!(
            "unsupported protocol version: {}",
            prefix.version
        )));
    }
    let Some(frame_type) = FrameType::from_u8(prefix.frame_type) else {
        return Err(invalid_data(format!(
            "invalid frame type: {:#04x}",
            prefix.frame_type
        )));
    };

    let header_len = prefix.header_len as usize;
    let payload_len = prefix.payload_len as usize;
    if header_len > MAX_HEADER_SIZE {
        return Err(invalid_data(format!(
            "header of {header_len} bytes exceeds the {MAX_HEADER_SIZE} byte cap"
        )));
    }
    if payload_len > max_message_size {
        return Err(invalid_data(format!(
            "payload of {payload_len} bytes exceeds the maximum message size"
        )));
    }

    let mut header = vec![0u8; header_len];
    read_exact_deadline(reader, &mut header).await?;
    let mut payload = vec![0u8; payload_len];
    read_exact_deadline(reader, &mut payload).await?;

    Ok(RawFrame {
        frame_type,
        header: header.into(),
        payload: payload.into(),
    })
}

// The read deadline is re-armed before every blocking read.
async fn read_exact_deadline(reader: &mut Reader, buf: &mut [u8]) -> io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    match timeout(READ_TIMEOUT, reader.read_exact(buf)).await {
        Ok(result) => result.map(|_| ()),
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "read deadline exceeded",
        )),
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
