//! Listener setup.

use std::io;
use std::net::SocketAddr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

/// # Bind a Listener
///
/// Creates a non-blocking TCP listener with `SO_REUSEADDR` set and the given
/// accept backlog. `mio::net::TcpListener::bind` hardcodes its own backlog, so the
/// socket is built with `socket2` and handed over afterwards.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}
