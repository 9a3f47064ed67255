//! Socket plumbing: creating listening / accepted / connecting TCP sockets, and classifying
//!  socket errors as transient or fatal.

use std::io;
use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

/// `send()` flags: a peer reset must surface as `EPIPE` rather than as a signal
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SEND_FLAGS: libc::c_int = 0;

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        || e.raw_os_error() == Some(libc::EAGAIN)
        || e.raw_os_error() == Some(libc::EWOULDBLOCK)
        || e.raw_os_error() == Some(libc::ENOMEM)
}

pub fn is_fatal_recv_error(e: &io::Error) -> bool {
    !is_transient(e)
}

pub fn is_fatal_send_error(e: &io::Error) -> bool {
    !is_transient(e)
}

pub fn is_fatal_connect_error(e: &io::Error) -> bool {
    !(matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
        || e.raw_os_error() == Some(libc::EINPROGRESS))
}

fn new_tcp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
}

/// a listening socket with `SO_REUSEADDR`; it is blocking, so `accept()` waits for a client
pub fn listen(addr: SocketAddr, backlog: i32) -> anyhow::Result<Socket> {
    let socket = new_tcp_socket(&addr)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))
        .with_context(|| format!("binding to {}", addr))?;
    socket.listen(backlog)?;

    info!("listening on {}", local_addr(&socket).unwrap_or(addr));
    Ok(socket)
}

/// Waits for a connection on a listening socket, returning it in non-blocking mode.
pub fn accept(listener: &Socket) -> anyhow::Result<(Socket, SocketAddr)> {
    let (socket, peer) = listener.accept()?;
    socket.set_nonblocking(true)?;

    let peer = peer.as_socket()
        .ok_or_else(|| anyhow!("accepted connection without an IP peer address"))?;
    info!("accepted connection from {}", peer);
    Ok((socket, peer))
}

/// Starts a non-blocking connect. The returned socket is typically still connecting, and the
///  outcome is reported as writability (success) or as a pending socket error (failure).
pub fn connect_nonblocking(addr: SocketAddr) -> anyhow::Result<Socket> {
    let socket = new_tcp_socket(&addr)?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => debug!("connected to {} immediately", addr),
        Err(e) if !is_fatal_connect_error(&e) => debug!("connecting to {}", addr),
        Err(e) => return Err(anyhow!("connecting to {} failed: {}", addr, e)),
    }
    Ok(socket)
}

/// The deferred error of a socket (`SO_ERROR`), clearing it. `Ok(None)` means no error.
pub fn pending_error(socket: &Socket) -> io::Result<Option<io::Error>> {
    socket.take_error()
}

pub fn local_addr(socket: &Socket) -> Option<SocketAddr> {
    socket.local_addr().ok()?.as_socket()
}
