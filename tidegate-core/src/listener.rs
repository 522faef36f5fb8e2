//! Listening sockets.

use crate::error::NetResult;
use crate::socket::{prepare_accepted, SocketId};
use socket2::{Domain, Protocol, SockAddr, Socket as OsSocket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// A non-blocking TCP listener. Stateless beyond open/closed.
pub struct Listener {
    /// Manager table key, doubles as the readiness token.
    id: SocketId,

    /// The listening handle.
    fd: RawFd,

    /// Address actually bound (resolves port 0).
    local_addr: SocketAddr,

    /// Guards the close so the handle is released exactly once.
    closed: AtomicBool,
}

impl Listener {
    /// Binds a non-blocking listener to `addr`.
    pub fn bind(id: SocketId, addr: SocketAddr, backlog: i32) -> NetResult<Self> {
        let socket = OsSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(backlog)?;

        let local_addr = socket
            .local_addr()?
            .as_socket()
            .unwrap_or(addr);
        info!(%local_addr, "listener bound");

        Ok(Self {
            id,
            fd: socket.into_raw_fd(),
            local_addr,
            closed: AtomicBool::new(false),
        })
    }

    /// Manager table key / readiness token.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The raw listening handle.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one pending connection, already non-blocking and with the
    /// standard options applied. `Ok(None)` means the backlog is empty.
    pub fn accept(&self) -> io::Result<Option<(RawFd, SocketAddr)>> {
        let listener = unsafe { OsSocket::from_raw_fd(self.fd) };
        let result = listener.accept();
        std::mem::forget(listener);

        match result {
            Ok((stream, peer)) => {
                prepare_accepted(&stream)?;
                let peer = peer
                    .as_socket()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet peer"))?;
                Ok(Some((stream.into_raw_fd(), peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Releases the listening handle. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            unsafe { libc::close(self.fd) };
            info!(local_addr = %self.local_addr, "listener closed");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_bind_accept_and_close() {
        let listener = Listener::bind(1, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().port(), 0);

        // Empty backlog: accept reports None rather than blocking.
        assert!(listener.accept().unwrap().is_none());

        let client = TcpStream::connect(listener.local_addr()).unwrap();

        // The handshake completes in the kernel; poll briefly.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = listener.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (fd, peer) = accepted.expect("no connection accepted");
        assert_eq!(peer.ip(), client.local_addr().unwrap().ip());
        unsafe { libc::close(fd) };

        listener.close();
        // Second close is a no-op.
        listener.close();
    }
}
