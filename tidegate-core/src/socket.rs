//! Socket lifecycle.
//!
//! A [`Socket`] couples a non-blocking platform handle with one pipeline
//! per direction and the atomic state that sequences its life:
//! `Idle → Connecting → Connected → Closing → Closed → PendingFree`.
//! Sockets are shared via `Arc`; the manager holds the last reference and
//! returns the buffers to the pool only after the close grace period.
//!
//! The `recv_armed`/`send_armed` flags are single-writer gates: exactly one
//! thread wins the 0→1 transition, and only the winner may touch that
//! direction's pipeline or re-register with the multiplexer. This is what
//! prevents duplicate registrations under concurrent readiness callbacks.

use crate::buffer::Pipeline;
use crate::config::EngineConfig;
use crate::error::NetResult;
use crate::poll::Poller;
use crate::pool::BufferPools;
use crate::transform::XorTransform;
use socket2::{Domain, Protocol, Socket as OsSocket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Identifies a socket in the manager table and in readiness tokens.
pub type SocketId = u64;

/// Lifecycle states of a socket.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, no connection attempt yet.
    Idle = 0,

    /// Non-blocking connect in flight.
    Connecting = 1,

    /// Registered with the multiplexer, traffic flowing.
    Connected = 2,

    /// Close requested; the handle is about to be released.
    Closing = 3,

    /// Handle released and registration removed.
    Closed = 4,

    /// On the delayed-release queue, waiting out the grace period.
    PendingFree = 5,
}

impl SocketState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::PendingFree,
        }
    }
}

/// A reference-counted connection endpoint.
pub struct Socket {
    /// Manager table key, doubles as the readiness token.
    id: SocketId,

    /// The non-blocking platform handle.
    fd: RawFd,

    /// Current [`SocketState`].
    state: AtomicU8,

    /// Single-writer gate for receive-side work.
    recv_armed: AtomicBool,

    /// Single-writer gate for send-side work.
    send_armed: AtomicBool,

    /// Set once application code has released the socket.
    released: AtomicBool,

    /// Peer address, known after connect/accept.
    peer: Option<SocketAddr>,

    /// Receive pipeline, created on first use.
    recv: Mutex<Option<Pipeline>>,

    /// Send pipeline, created on first use.
    send: Mutex<Option<Pipeline>>,

    /// Serializes interest computation with multiplexer re-registration,
    /// so the arm call that lands last always reflects the latest queue
    /// state.
    reg: Mutex<()>,

    /// Engine configuration driving lazy pipeline construction.
    config: Arc<EngineConfig>,

    /// Block pools backing the pipelines.
    pools: Arc<BufferPools>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Wraps an already non-blocking handle.
    pub fn new(
        id: SocketId,
        fd: RawFd,
        peer: Option<SocketAddr>,
        config: Arc<EngineConfig>,
        pools: Arc<BufferPools>,
    ) -> Self {
        Self {
            id,
            fd,
            state: AtomicU8::new(SocketState::Idle as u8),
            recv_armed: AtomicBool::new(false),
            send_armed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            peer,
            recv: Mutex::new(None),
            send: Mutex::new(None),
            reg: Mutex::new(()),
            config,
            pools,
        }
    }

    /// Manager table key / readiness token.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The raw platform handle.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the `from → to` state transition; false if another thread
    /// moved the state first.
    pub fn try_transition(&self, from: SocketState, to: SocketState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True while the socket may carry traffic.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), SocketState::Connecting | SocketState::Connected)
    }

    // ---- armed gates -------------------------------------------------

    /// Wins or loses the receive gate. The winner must call
    /// [`disarm_recv`](Self::disarm_recv) when its pass is done.
    pub fn try_arm_recv(&self) -> bool {
        self.recv_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the receive gate.
    pub fn disarm_recv(&self) {
        self.recv_armed.store(false, Ordering::Release);
    }

    /// Wins or loses the send gate.
    pub fn try_arm_send(&self) -> bool {
        self.send_armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the send gate.
    pub fn disarm_send(&self) {
        self.send_armed.store(false, Ordering::Release);
    }

    /// Holds the registration lock for the duration of an interest
    /// computation plus the arm call that follows it.
    pub fn registration_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.reg)
    }

    // ---- release tracking --------------------------------------------

    /// Marks the application's handle as released.
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// True once application code has let go of the socket.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    // ---- pipelines ---------------------------------------------------

    /// Runs `f` against the receive pipeline, creating it on first use
    /// according to the engine configuration.
    pub fn with_recv_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        let mut guard = lock(&self.recv);
        let pipeline = guard.get_or_insert_with(|| {
            let mut p = Pipeline::receiver(
                self.pools.clone(),
                self.config.max_message_size,
                self.config.recv_buffer_limit,
            );
            if self.config.enable_compression {
                p.enable_compression();
            }
            if self.config.enable_encryption {
                p.set_transform(Box::new(XorTransform::new(self.config.xor_key.clone())));
            }
            if self.config.strip_proxy_header {
                p.enable_proxy_strip();
            }
            p
        });
        f(pipeline)
    }

    /// Runs `f` against the send pipeline, creating it on first use.
    pub fn with_send_pipeline<R>(&self, f: impl FnOnce(&mut Pipeline) -> R) -> R {
        let mut guard = lock(&self.send);
        let pipeline = guard.get_or_insert_with(|| {
            let mut p = Pipeline::sender(
                self.pools.clone(),
                self.config.max_message_size,
                self.config.send_buffer_limit,
            );
            if self.config.enable_compression {
                p.enable_compression();
            }
            if self.config.enable_encryption {
                p.set_transform(Box::new(XorTransform::new(self.config.xor_key.clone())));
            }
            p
        });
        f(pipeline)
    }

    /// Bytes still queued for the wire.
    pub fn send_pending(&self) -> usize {
        lock(&self.send).as_ref().map_or(0, Pipeline::buffered)
    }

    /// Drops both pipelines, returning their blocks to the pool. Called by
    /// the manager once the grace period has elapsed.
    pub fn release_buffers(&self) {
        lock(&self.recv).take();
        lock(&self.send).take();
    }

    // ---- raw I/O -----------------------------------------------------

    /// Non-blocking read into `buf`. `Ok(0)` means the peer closed.
    pub fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Non-blocking write of `data`, returning bytes the OS accepted.
    pub fn write_chunk(&self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Checks the outcome of a non-blocking connect once writability is
    /// reported.
    pub fn take_connect_error(&self) -> io::Result<()> {
        let socket = unsafe { OsSocket::from_raw_fd(self.fd) };
        let result = socket.take_error();
        std::mem::forget(socket);
        match result? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- close -------------------------------------------------------

    /// Moves the socket to `Closing`, removes its registration and
    /// releases the handle. Idempotent: only the first caller acts, every
    /// later call is a no-op returning false.
    pub fn close(&self, poller: &Poller) -> bool {
        let won = self.try_transition(SocketState::Idle, SocketState::Closing)
            || self.try_transition(SocketState::Connecting, SocketState::Closing)
            || self.try_transition(SocketState::Connected, SocketState::Closing);
        if !won {
            trace!(id = self.id, "close on already-closing socket ignored");
            return false;
        }

        if let Err(e) = poller.deregister(self.fd) {
            debug!(id = self.id, error = %e, "deregister during close failed");
        }
        unsafe { libc::close(self.fd) };
        self.state
            .store(SocketState::Closed as u8, Ordering::Release);
        debug!(id = self.id, peer = ?self.peer, "socket closed");
        true
    }

    /// Moves a closed socket onto the delayed-release path.
    pub fn mark_pending_free(&self) -> bool {
        self.try_transition(SocketState::Closed, SocketState::PendingFree)
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Starts a non-blocking connect. Returns the handle and whether the
/// connection completed synchronously.
pub fn connect_nonblocking(addr: SocketAddr) -> NetResult<(RawFd, bool)> {
    let domain = Domain::for_address(addr);
    let socket = OsSocket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    let immediate = match socket.connect(&addr.into()) {
        Ok(()) => true,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(e) => return Err(e.into()),
    };
    Ok((socket.into_raw_fd(), immediate))
}

/// Applies the standard options to a freshly accepted handle.
pub fn prepare_accepted(socket: &OsSocket) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_socket(fd: RawFd) -> Socket {
        let config = Arc::new(EngineConfig::default());
        let pools = Arc::new(BufferPools::new(256, 64, 1024, 8));
        Socket::new(1, fd, None, config, pools)
    }

    #[test]
    fn test_state_transitions() {
        // A socketpair-free state exercise: use a throwaway fd.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.into_raw_fd();
        let socket = test_socket(fd);

        assert_eq!(socket.state(), SocketState::Idle);
        assert!(socket.try_transition(SocketState::Idle, SocketState::Connecting));
        assert!(!socket.try_transition(SocketState::Idle, SocketState::Connecting));
        assert!(socket.try_transition(SocketState::Connecting, SocketState::Connected));
        assert!(socket.is_open());

        let poller = Poller::new().unwrap();
        assert!(socket.close(&poller));
        assert_eq!(socket.state(), SocketState::Closed);

        // Idempotent: a second close does nothing.
        assert!(!socket.close(&poller));
        assert_eq!(socket.state(), SocketState::Closed);

        assert!(socket.mark_pending_free());
        assert!(!socket.mark_pending_free());
    }

    #[test]
    fn test_armed_gates_are_single_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.into_raw_fd();
        let socket = test_socket(fd);

        assert!(socket.try_arm_recv());
        assert!(!socket.try_arm_recv());
        socket.disarm_recv();
        assert!(socket.try_arm_recv());

        // The two gates are independent.
        assert!(socket.try_arm_send());
        assert!(!socket.try_arm_send());
        socket.disarm_send();

        socket.disarm_recv();
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_pipelines_created_lazily_and_released() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.into_raw_fd();
        let config = Arc::new(EngineConfig::default());
        let pools = Arc::new(BufferPools::new(256, 64, 1024, 8));
        let socket = Socket::new(9, fd, None, config, pools.clone());

        assert_eq!(pools.total_in_use(), 0);
        socket
            .with_send_pipeline(|p| p.queue_message(b"abc"))
            .unwrap();
        assert!(pools.total_in_use() > 0);
        assert!(socket.send_pending() > 0);

        socket.release_buffers();
        assert_eq!(pools.total_in_use(), 0);
        unsafe { libc::close(fd) };
    }
}
