//! Live-socket tracking and delayed release.
//!
//! The manager maps readiness tokens to sockets/listeners and owns the
//! delayed-release queue: a closed socket waits out a grace period, and
//! until its reference count has drained back to the queue's own handle,
//! before its buffers return to the pool. That gap is what guarantees a
//! worker mid-callback never touches reclaimed memory.

use super::EventHandler;
use crate::listener::Listener;
use crate::socket::{Socket, SocketId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Extra delay before re-checking a socket whose references have not
/// drained when its grace deadline arrives.
const REF_DRAIN_RECHECK: Duration = Duration::from_millis(50);

/// An entry in the readiness-token table.
#[derive(Clone)]
pub enum Registered {
    /// A connection endpoint and its application handler.
    Socket(Arc<Socket>, Arc<dyn EventHandler>),

    /// A listener; accepted sockets inherit the handler.
    Listener(Arc<Listener>, Arc<dyn EventHandler>),
}

/// A socket waiting out the close grace period.
struct PendingFree {
    deadline: Instant,
    socket: Arc<Socket>,
}

/// Tracks every live socket and listener plus the delayed-release queue.
pub struct SocketManager {
    /// Next readiness token to hand out.
    next_id: AtomicU64,

    /// Token table for event dispatch.
    entries: DashMap<SocketId, Registered>,

    /// Sockets waiting out the grace period, oldest first.
    pending_free: Mutex<VecDeque<PendingFree>>,

    /// Receive-throttled sockets awaiting a re-arm check.
    throttled: Mutex<Vec<Arc<Socket>>>,

    /// Grace period between retirement and buffer reclamation.
    grace: Duration,

    max_sockets: usize,
    max_listeners: usize,
    socket_count: AtomicUsize,
    listener_count: AtomicUsize,
}

impl SocketManager {
    /// Creates an empty manager.
    pub fn new(grace: Duration, max_sockets: usize, max_listeners: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            pending_free: Mutex::new(VecDeque::new()),
            throttled: Mutex::new(Vec::new()),
            grace,
            max_sockets,
            max_listeners,
            socket_count: AtomicUsize::new(0),
            listener_count: AtomicUsize::new(0),
        }
    }

    /// Hands out the next readiness token.
    pub fn next_id(&self) -> SocketId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a socket. Fails when the socket capacity is reached.
    pub fn insert_socket(
        &self,
        socket: Arc<Socket>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), Arc<Socket>> {
        let count = self.socket_count.fetch_add(1, Ordering::AcqRel);
        if count >= self.max_sockets {
            self.socket_count.fetch_sub(1, Ordering::AcqRel);
            warn!(max = self.max_sockets, "socket capacity reached");
            return Err(socket);
        }
        self.entries
            .insert(socket.id(), Registered::Socket(socket, handler));
        Ok(())
    }

    /// Registers a listener. Fails when the listener capacity is reached.
    pub fn insert_listener(
        &self,
        listener: Arc<Listener>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), Arc<Listener>> {
        let count = self.listener_count.fetch_add(1, Ordering::AcqRel);
        if count >= self.max_listeners {
            self.listener_count.fetch_sub(1, Ordering::AcqRel);
            warn!(max = self.max_listeners, "listener capacity reached");
            return Err(listener);
        }
        self.entries
            .insert(listener.id(), Registered::Listener(listener, handler));
        Ok(())
    }

    /// Resolves a readiness token to its entry.
    pub fn lookup(&self, token: SocketId) -> Option<Registered> {
        self.entries.get(&token).map(|e| e.value().clone())
    }

    /// Removes a listener from the table.
    pub fn remove_listener(&self, id: SocketId) {
        if self.entries.remove(&id).is_some() {
            self.listener_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Moves a closed socket onto the delayed-release queue. The entry
    /// leaves the token table immediately (no further events dispatch to
    /// it) but its buffers survive until the grace period elapses.
    pub fn retire(&self, socket: Arc<Socket>) {
        if self.entries.remove(&socket.id()).is_none() {
            // Already retired by another thread.
            return;
        }
        self.socket_count.fetch_sub(1, Ordering::AcqRel);
        socket.mark_released();
        socket.mark_pending_free();
        trace!(id = socket.id(), "socket queued for delayed release");

        let mut queue = lock(&self.pending_free);
        queue.push_back(PendingFree {
            deadline: Instant::now() + self.grace,
            socket,
        });
    }

    /// Releases the buffers of every socket whose grace deadline passed
    /// and whose reference count has drained to the queue's own handle.
    /// Returns the number of sockets freed.
    pub fn reap(&self, now: Instant) -> usize {
        let mut queue = lock(&self.pending_free);
        let mut freed = 0;

        while let Some(front) = queue.front() {
            if front.deadline > now {
                break;
            }
            let entry = queue.pop_front().unwrap_or_else(|| unreachable!());
            if Arc::strong_count(&entry.socket) == 1 {
                entry.socket.release_buffers();
                trace!(id = entry.socket.id(), "socket buffers reclaimed");
                freed += 1;
            } else {
                // A callback or application handle is still alive; check
                // again shortly.
                queue.push_back(PendingFree {
                    deadline: now + REF_DRAIN_RECHECK,
                    socket: entry.socket,
                });
                break;
            }
        }
        freed
    }

    /// Immediately reclaims everything on the release queue. Shutdown
    /// only: the worker threads are already joined by then.
    pub fn drain_pending(&self) {
        let mut queue = lock(&self.pending_free);
        for entry in queue.drain(..) {
            entry.socket.release_buffers();
        }
    }

    /// Parks a receive-throttled socket for a later re-arm check.
    pub fn park_throttled(&self, socket: Arc<Socket>) {
        lock(&self.throttled).push(socket);
    }

    /// Takes the current set of throttled sockets. The engine re-parks
    /// any that are still over their limit.
    pub fn take_throttled(&self) -> Vec<Arc<Socket>> {
        std::mem::take(&mut lock(&self.throttled))
    }

    /// Live (not yet retired) sockets.
    pub fn live_sockets(&self) -> usize {
        self.socket_count.load(Ordering::Relaxed)
    }

    /// Sockets still waiting out the grace period.
    pub fn pending_free(&self) -> usize {
        lock(&self.pending_free).len()
    }

    /// Every entry currently in the token table. Used at shutdown to
    /// close remaining handles.
    pub fn drain_entries(&self) -> Vec<Registered> {
        let entries: Vec<Registered> = self.entries.iter().map(|e| e.value().clone()).collect();
        self.entries.clear();
        self.socket_count.store(0, Ordering::Relaxed);
        self.listener_count.store(0, Ordering::Relaxed);
        entries
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pool::BufferPools;

    struct NullHandler;
    impl EventHandler for NullHandler {
        fn on_message(&self, _socket: &Arc<Socket>, _payload: Vec<u8>) {}
    }

    fn test_socket(manager: &SocketManager) -> Arc<Socket> {
        let config = Arc::new(EngineConfig::default());
        let pools = Arc::new(BufferPools::new(64, 16, 256, 4));
        // A manager test never does I/O on the fd; -1 stands in.
        Arc::new(Socket::new(manager.next_id(), -1, None, config, pools))
    }

    #[test]
    fn test_capacity_limits() {
        let manager = SocketManager::new(Duration::from_secs(1), 2, 1);
        let handler: Arc<dyn EventHandler> = Arc::new(NullHandler);

        let a = test_socket(&manager);
        let b = test_socket(&manager);
        let c = test_socket(&manager);
        assert!(manager.insert_socket(a, handler.clone()).is_ok());
        assert!(manager.insert_socket(b, handler.clone()).is_ok());
        assert!(manager.insert_socket(c, handler.clone()).is_err());
        assert_eq!(manager.live_sockets(), 2);
    }

    #[test]
    fn test_retire_and_reap_honour_grace_period() {
        let grace = Duration::from_millis(50);
        let manager = SocketManager::new(grace, 8, 1);
        let handler: Arc<dyn EventHandler> = Arc::new(NullHandler);

        let socket = test_socket(&manager);
        let id = socket.id();
        manager.insert_socket(socket.clone(), handler).unwrap();
        assert!(manager.lookup(id).is_some());

        manager.retire(socket.clone());
        assert!(manager.lookup(id).is_none());
        assert_eq!(manager.pending_free(), 1);

        // Before the deadline nothing is freed.
        assert_eq!(manager.reap(Instant::now()), 0);

        // After the deadline the queue still holds our extra handle.
        let later = Instant::now() + grace + Duration::from_millis(10);
        assert_eq!(manager.reap(later), 0);
        assert_eq!(manager.pending_free(), 1);

        // Once we drop it the references have drained.
        drop(socket);
        let later = later + REF_DRAIN_RECHECK + Duration::from_millis(10);
        assert_eq!(manager.reap(later), 1);
        assert_eq!(manager.pending_free(), 0);
    }

    #[test]
    fn test_retire_is_idempotent() {
        let manager = SocketManager::new(Duration::from_millis(10), 8, 1);
        let handler: Arc<dyn EventHandler> = Arc::new(NullHandler);
        let socket = test_socket(&manager);
        manager.insert_socket(socket.clone(), handler).unwrap();

        manager.retire(socket.clone());
        manager.retire(socket.clone());
        assert_eq!(manager.pending_free(), 1);
        assert_eq!(manager.live_sockets(), 0);
    }
}
