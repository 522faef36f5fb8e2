//! Readiness multiplexer.
//!
//! This module provides socket readiness notification using the platform
//! facility: epoll on Linux, kqueue on macOS and the BSDs. Both backends
//! expose the same `Poller` type, re-exported here, so the engine is
//! written against a single API.
//!
//! Registrations are one-shot: once a socket fires it stays quiet until a
//! worker re-arms it, which is what makes the single-writer armed-flag
//! protocol in the socket layer sound.

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::Poller;

/// Identifies a registered socket in readiness events.
pub type Token = u64;

/// Token reserved for the poller's internal wake handle.
pub const WAKE_TOKEN: Token = u64::MAX;

/// Which readiness kinds a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Wake when the socket is readable.
    pub readable: bool,

    /// Wake when the socket is writable.
    pub writable: bool,
}

impl Interest {
    /// Readable readiness only.
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    /// Writable readiness only.
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    /// Both readiness kinds.
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// One readiness event reported by a wait call.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Token the socket was registered with.
    pub token: Token,

    /// The socket has bytes to read (or the peer hung up, which a read
    /// observes as EOF).
    pub readable: bool,

    /// The socket can accept writes.
    pub writable: bool,

    /// The OS flagged an error condition on the socket.
    pub is_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_oneshot_readability() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let poller = Poller::new().unwrap();
        poller
            .arm(server.as_raw_fd(), 7, Interest::READABLE)
            .unwrap();

        // Nothing sent yet: the wait must time out quietly.
        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.iter().all(|e| e.token != 7));

        use std::io::Write;
        let mut client = client;
        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        let event = events.iter().find(|e| e.token == 7).unwrap();
        assert!(event.readable);

        // One-shot: without a re-arm the socket stays quiet even though
        // the bytes were never read.
        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.iter().all(|e| e.token != 7));

        // Re-armed, it fires again.
        poller
            .arm(server.as_raw_fd(), 7, Interest::READABLE)
            .unwrap();
        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert!(events.iter().any(|e| e.token == 7 && e.readable));

        poller.deregister(server.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let poller = std::sync::Arc::new(Poller::new().unwrap());
        let waker = poller.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let start = std::time::Instant::now();
        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_secs(10)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
