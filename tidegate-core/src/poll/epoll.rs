//! epoll backend for Linux.

use super::{Event, Interest, Token, WAKE_TOKEN};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::trace;

/// Upper bound on events translated per wait call.
const MAX_EVENTS: usize = 256;

/// Readiness multiplexer backed by epoll.
///
/// Shared across threads behind an `Arc`: registration calls may race with
/// a blocked wait call, which epoll permits.
pub struct Poller {
    /// The epoll instance.
    epfd: RawFd,

    /// Read end of the wake pipe, registered level-triggered.
    wake_read: RawFd,

    /// Write end of the wake pipe.
    wake_write: RawFd,
}

// RawFds are plain integers; the kernel object is thread-safe.
unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    /// Creates the epoll instance and its wake pipe.
    pub fn new() -> io::Result<Self> {
        let epfd = check(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(e) = check(unsafe {
            libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        }) {
            unsafe { libc::close(epfd) };
            return Err(e);
        }
        let [wake_read, wake_write] = pipe_fds;

        // The wake pipe is the one persistent, level-triggered registration.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if let Err(e) = check(unsafe {
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_read, &mut ev)
        }) {
            unsafe {
                libc::close(epfd);
                libc::close(wake_read);
                libc::close(wake_write);
            }
            return Err(e);
        }

        Ok(Self {
            epfd,
            wake_read,
            wake_write,
        })
    }

    /// Registers or re-arms `fd` for one-shot readiness with `token`.
    pub fn arm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: event_mask(interest),
            u64: token,
        };
        // First arm is an ADD; later re-arms after the one-shot fired are
        // MODs on the still-present registration.
        match check(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) }) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                check(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) })
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Removes `fd` from the readiness set. Missing registrations are not
    /// an error (close may race with a worker's disarm).
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        match check(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) }) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocks until readiness arrives, the timeout elapses or a wake is
    /// issued, appending translated events to `events`.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map_or(-1i32, |t| {
            t.as_millis().min(i32::MAX as u128) as i32
        });

        let mut buf: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let count = match check(unsafe {
            libc::epoll_wait(self.epfd, buf.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        }) {
            Ok(n) => n as usize,
            // A signal interrupting the wait is a retriable condition.
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        };

        for raw in buf.iter().take(count) {
            if raw.u64 == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            let flags = raw.events;
            events.push(Event {
                token: raw.u64,
                readable: flags & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                is_error: flags & libc::EPOLLERR as u32 != 0,
            });
        }
        trace!(events = events.len(), "epoll wait returned");
        Ok(())
    }

    /// Interrupts a blocked wait call.
    pub fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let n = unsafe { libc::write(self.wake_write, (&byte as *const u8).cast(), 1) };
        // A full pipe already guarantees a pending wake.
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_read, buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
            libc::close(self.epfd);
        }
    }
}

fn event_mask(interest: Interest) -> u32 {
    let mut mask = (libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;
    if interest.readable {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.writable {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn check(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
