//! kqueue backend for macOS and the BSDs.

use super::{Event, Interest, Token, WAKE_TOKEN};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;
use tracing::trace;

/// Upper bound on events translated per wait call.
const MAX_EVENTS: usize = 256;

/// Readiness multiplexer backed by kqueue.
pub struct Poller {
    /// The kqueue instance.
    kq: RawFd,

    /// Read end of the wake pipe, registered persistently.
    wake_read: RawFd,

    /// Write end of the wake pipe.
    wake_write: RawFd,
}

unsafe impl Send for Poller {}
unsafe impl Sync for Poller {}

impl Poller {
    /// Creates the kqueue instance and its wake pipe.
    pub fn new() -> io::Result<Self> {
        let kq = check(unsafe { libc::kqueue() })?;

        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(e) = check(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }) {
            unsafe { libc::close(kq) };
            return Err(e);
        }
        let [wake_read, wake_write] = pipe_fds;
        unsafe {
            libc::fcntl(wake_read, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(wake_write, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let poller = Self {
            kq,
            wake_read,
            wake_write,
        };

        // Persistent (non-one-shot) read filter for the wake pipe.
        let change = kevent(
            wake_read as usize,
            libc::EVFILT_READ,
            libc::EV_ADD,
            WAKE_TOKEN,
        );
        poller.apply(&[change])?;
        Ok(poller)
    }

    /// Registers or re-arms `fd` for one-shot readiness with `token`.
    pub fn arm(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.readable {
            changes.push(kevent(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_ONESHOT,
                token,
            ));
        }
        if interest.writable {
            changes.push(kevent(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_ONESHOT,
                token,
            ));
        }
        self.apply(&changes)
    }

    /// Removes both filters for `fd`. Missing filters are not an error:
    /// a one-shot that already fired is gone, and close may race with a
    /// worker's disarm.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let change = kevent(fd as usize, filter, libc::EV_DELETE, 0);
            match self.apply(&[change]) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Blocks until readiness arrives, the timeout elapses or a wake is
    /// issued, appending translated events to `events`.
    pub fn wait(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const _);

        let mut buf: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let count = match check(unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                MAX_EVENTS as i32,
                ts_ptr,
            )
        }) {
            Ok(n) => n as usize,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        };

        for raw in buf.iter().take(count) {
            let token = raw.udata as Token;
            if token == WAKE_TOKEN {
                self.drain_wake();
                continue;
            }
            events.push(Event {
                token,
                readable: raw.filter == libc::EVFILT_READ,
                writable: raw.filter == libc::EVFILT_WRITE,
                is_error: raw.flags & libc::EV_ERROR != 0,
            });
        }
        trace!(events = events.len(), "kqueue wait returned");
        Ok(())
    }

    /// Interrupts a blocked wait call.
    pub fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        let n = unsafe { libc::write(self.wake_write, (&byte as *const u8).cast(), 1) };
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

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        check(unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })
        .map(|_| ())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
            libc::close(self.kq);
        }
    }
}

fn kevent(ident: usize, filter: i16, flags: u16, token: Token) -> libc::kevent {
    libc::kevent {
        ident,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as *mut libc::c_void,
    }
}

fn check(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
