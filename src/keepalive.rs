//! Ping timer and idle-timeout watcher.
//!
//! The read loop resets both whenever a complete frame arrives; any peer
//! traffic proves liveness, so a ping is only emitted after a full silent
//! interval. The reset channels are bounded and fed with `try_send`, so
//! the read loop never blocks on a stale watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use crate::codec::Codec;
use crate::socket::Socket;

pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const SOCKET_TIMEOUT: Duration = Duration::from_secs(45);

/// Emits a ping whenever the peer has been silent for a full interval.
pub(crate) async fn ping_loop<C: Codec>(socket: Arc<Socket<C>>, mut reset: mpsc::Receiver<()>) {
    let closed = socket.closed();
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            received = reset.recv() => {
                if received.is_none() {
                    return;
                }
                // Peer traffic seen; restart the interval.
            }
            _ = time::sleep(PING_INTERVAL) => {
                if let Err(err) = socket.send_ping().await {
                    tracing::warn!(%err, "socket: failed to send ping request");
                }
            }
        }
    }
}

/// Closes the socket when no frame arrives within the idle window.
pub(crate) async fn timeout_loop<C: Codec>(socket: Arc<Socket<C>>, mut reset: mpsc::Receiver<()>) {
    let closed = socket.closed();
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            received = reset.recv() => {
                if received.is_none() {
                    return;
                }
            }
            _ = time::sleep(SOCKET_TIMEOUT) => {
                tracing::warn!(id = socket.id(), "socket: closed: idle timeout reached");
                socket.close();
                return;
            }
        }
    }
}
