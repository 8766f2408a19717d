//! The fleet manager: accepts streams and owns the set of live sockets.
//!
//! A [`Server`] is a thin composition layer around [`Socket`]: every
//! accepted stream becomes a socket with a fresh 20-character identifier,
//! tracked in a live map until its close broadcast fires. Connection setup
//! runs on a bounded worker pool so a slow `on_new_socket` callback never
//! stalls the accept loop.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::chain::random_string;
use crate::codec::{Codec, MsgPack};
use crate::socket::Socket;

const SOCKET_ID_LENGTH: usize = 20;
const NEW_CONN_QUEUE: usize = 10;
const DEFAULT_WORKERS: usize = 20;

/// Source of accepted connections, the seam between transport setup and
/// the fleet manager.
pub trait Accept: Send + Sync + 'static {
    /// The byte stream this source produces.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next connection; the address is the remote endpoint,
    /// when the transport knows one.
    fn accept(
        &self,
    ) -> impl Future<Output = io::Result<(Self::Stream, Option<SocketAddr>)>> + Send;

    /// The address this source listens on, when known.
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn accept(
        &self,
    ) -> impl Future<Output = io::Result<(TcpStream, Option<SocketAddr>)>> + Send {
        async move {
            let (stream, remote_addr) = TcpListener::accept(self).await?;
            Ok((stream, Some(remote_addr)))
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Number of tasks handling new connections.
    pub workers: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

type NewSocketCallback<C> = Arc<dyn Fn(Arc<Socket<C>>) + Send + Sync>;

/// Accepts connections and tracks the resulting sockets until they close.
pub struct Server<A: Accept, C: Codec = MsgPack> {
    accept: A,
    codec: C,

    sockets: Mutex<HashMap<String, Arc<Socket<C>>>>,
    on_new_socket: Mutex<Option<NewSocketCallback<C>>>,

    conn_tx: mpsc::Sender<(A::Stream, Option<SocketAddr>)>,

    close_token: CancellationToken,
    close_started: Mutex<bool>,
}

impl<A: Accept> Server<A> {
    /// Create a server with default options and the msgpack codec.
    /// Connection workers are spawned immediately.
    pub fn new(accept: A) -> Arc<Self> {
        Self::with_options(accept, ServerOptions::default())
    }

    /// Create a server with explicit options.
    pub fn with_options(accept: A, options: ServerOptions) -> Arc<Self> {
        Self::with_codec(accept, MsgPack, options)
    }
}

impl<A: Accept, C: Codec> Server<A, C> {
    /// Create a server whose sockets use a custom codec.
    pub fn with_codec(accept: A, codec: C, options: ServerOptions) -> Arc<Self> {
        let workers = if options.workers == 0 {
            DEFAULT_WORKERS
        } else {
            options.workers
        };

        let (conn_tx, conn_rx) = mpsc::channel(NEW_CONN_QUEUE);
        let server = Arc::new(Self {
            accept,
            codec,
            sockets: Mutex::new(HashMap::new()),
            on_new_socket: Mutex::new(None),
            conn_tx,
            close_token: CancellationToken::new(),
            close_started: Mutex::new(false),
        });

        let conn_rx = Arc::new(AsyncMutex::new(conn_rx));
        for _ in 0..workers {
            tokio::spawn(server.clone().connection_worker(conn_rx.clone()));
        }

        server
    }

    /// Set the callback invoked for every accepted socket. The callback
    /// registers functions and calls [`Socket::ready`]; it runs on a
    /// connection worker.
    pub fn on_new_socket<F>(&self, callback: F)
    where
        F: Fn(Arc<Socket<C>>) + Send + Sync + 'static,
    {
        *self.on_new_socket.lock() = Some(Arc::new(callback));
    }

    /// Accept connections until the server closes. Blocking; run it on its
    /// own task.
    pub async fn listen(self: &Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.close_token.cancelled() => break,
                accepted = self.accept.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    if self.conn_tx.send((stream, remote_addr)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    if self.is_closed() {
                        break;
                    }
                    tracing::warn!(%err, "server: failed to accept connection");
                }
            }
        }

        self.close();
    }

    /// All currently connected sockets.
    pub fn sockets(&self) -> Vec<Arc<Socket<C>>> {
        self.sockets.lock().values().cloned().collect()
    }

    /// Look up a connected socket by its identifier.
    pub fn get_socket(&self, id: &str) -> Option<Arc<Socket<C>>> {
        self.sockets.lock().get(id).cloned()
    }

    /// Whether the close broadcast has fired.
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// A token observing the close broadcast.
    pub fn closed(&self) -> CancellationToken {
        self.close_token.clone()
    }

    /// Run `hook` once when the server closes. May be called any number
    /// of times.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.close_token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            hook();
        });
    }

    /// Close the server and every connected socket. Idempotent.
    pub fn close(&self) {
        {
            let mut started = self.close_started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        self.close_token.cancel();

        let sockets = self.sockets();
        for socket in sockets {
            socket.close();
        }
    }

    async fn connection_worker(
        self: Arc<Self>,
        conn_rx: Arc<AsyncMutex<mpsc::Receiver<(A::Stream, Option<SocketAddr>)>>>,
    ) {
        loop {
            let next = {
                let mut conn_rx = conn_rx.lock().await;
                tokio::select! {
                    _ = self.close_token.cancelled() => return,
                    next = conn_rx.recv() => next,
                }
            };

            let Some((stream, remote_addr)) = next else {
                return;
            };
            self.handle_connection(stream, remote_addr);
        }
    }

    fn handle_connection(self: &Arc<Self>, stream: A::Stream, remote_addr: Option<SocketAddr>) {
        // Mint the identifier and insert under one lock so concurrent
        // workers cannot race the uniqueness check.
        let socket = {
            let mut sockets = self.sockets.lock();
            let id = loop {
                let id = random_string(SOCKET_ID_LENGTH);
                if !sockets.contains_key(&id) {
                    break id;
                }
            };
            let socket = Socket::build(
                stream,
                self.codec.clone(),
                id.clone(),
                self.accept.local_addr(),
                remote_addr,
            );
            sockets.insert(id, socket.clone());
            socket
        };

        // Drop the map entry once the socket closes.
        let server = self.clone();
        let closed = socket.closed();
        let socket_id = socket.id().to_owned();
        tokio::spawn(async move {
            closed.cancelled().await;
            server.sockets.lock().remove(&socket_id);
        });

        let callback = self.on_new_socket.lock().clone();
        if let Some(callback) = callback {
            let socket = socket.clone();
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(move || callback(socket)))
            {
                let message = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic");
                tracing::error!(panic = message, "server: on_new_socket callback panicked");
            }
        }
    }
}
