//! TCP convenience constructors.

use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::server::Server;
use crate::socket::Socket;

/// Dial `addr` and wrap the stream in a socket. Register functions, then
/// call [`Socket::ready`].
pub async fn connect(addr: &str) -> io::Result<Arc<Socket>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Socket::from_tcp(stream))
}

/// Bind `addr` and return a server accepting PAKT sockets on it.
pub async fn listen(addr: &str) -> io::Result<Arc<Server<TcpListener>>> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Server::new(listener))
}
