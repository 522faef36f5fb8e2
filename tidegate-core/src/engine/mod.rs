//! The socket engine.
//!
//! This module wires the pieces together:
//! - a dedicated poller thread blocks in the multiplexer wait call and
//!   feeds ready events into an MPMC queue,
//! - a fixed pool of workers drains the queue and runs the accept,
//!   receive and send passes,
//! - the [`SocketManager`] maps readiness tokens to sockets and owns the
//!   delayed-release queue.
//!
//! Registrations are one-shot, so after every pass the worker re-computes
//! the socket's interest (readable unless receive-throttled, writable when
//! bytes are queued) and re-arms in one call under the socket's
//! registration lock. Application callbacks run on worker threads and must
//! not block.

mod manager;
mod workers;

pub use manager::{Registered, SocketManager};
pub use workers::WorkerPool;

use crate::config::EngineConfig;
use crate::error::{is_retriable, NetError, NetResult};
use crate::listener::Listener;
use crate::poll::{Event, Interest, Poller};
use crate::pool::BufferPools;
use crate::socket::{connect_nonblocking, Socket, SocketState};
use crossbeam_channel::{Receiver, Sender};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Application callbacks, invoked from worker threads.
///
/// A handler is shared across every socket it was registered for, so it
/// carries no per-connection mutable state unless it synchronizes it
/// itself.
pub trait EventHandler: Send + Sync {
    /// A connection was accepted or an outbound connect completed.
    fn on_connected(&self, _socket: &Arc<Socket>) {}

    /// A complete framed message arrived.
    fn on_message(&self, socket: &Arc<Socket>, payload: Vec<u8>);

    /// Raw-passthrough bytes arrived, delivered ahead of any framed
    /// message. Fires only after [`EngineHandle::expect_raw`] opened a
    /// window on the socket; a split window may fire more than once.
    fn on_raw(&self, _socket: &Arc<Socket>, _bytes: Vec<u8>) {}

    /// The connection closed, locally or by the peer. Fires at most once.
    fn on_closed(&self, _socket: &Arc<Socket>) {}
}

/// Monotonic engine counters.
#[derive(Default)]
pub struct EngineStats {
    connections_accepted: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// A point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Inbound connections accepted.
    pub connections_accepted: u64,

    /// Outbound connections that completed their handshake.
    pub connections_opened: u64,

    /// Connections closed, either side.
    pub connections_closed: u64,

    /// Framed messages delivered to handlers.
    pub messages_received: u64,

    /// Framed messages queued by the application.
    pub messages_sent: u64,

    /// Bytes read off the wire.
    pub bytes_received: u64,

    /// Bytes the OS accepted for transmission.
    pub bytes_sent: u64,
}

impl EngineStats {
    /// Copies the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the poller thread, the workers and every handle.
struct EngineShared {
    config: Arc<EngineConfig>,
    pools: Arc<BufferPools>,
    poller: Arc<Poller>,
    manager: Arc<SocketManager>,
    stats: EngineStats,
    shutdown: AtomicBool,
}

/// A cloneable handle for driving the engine from application code,
/// including from inside [`EventHandler`] callbacks.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

/// The running engine. Owns the poller thread and the worker pool;
/// dropping it shuts everything down.
pub struct Engine {
    shared: Arc<EngineShared>,
    poller_thread: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
}

impl Engine {
    /// Validates the configuration, creates the multiplexer and spawns the
    /// poller thread plus the worker pool.
    pub fn start(config: EngineConfig) -> NetResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pools = Arc::new(BufferPools::new(
            config.small_block_size,
            config.small_block_count,
            config.big_block_size,
            config.big_block_count,
        ));
        let poller = Arc::new(Poller::new()?);
        let manager = Arc::new(SocketManager::new(
            config.grace_period,
            config.max_sockets,
            config.max_listeners,
        ));

        let shared = Arc::new(EngineShared {
            config,
            pools,
            poller,
            manager,
            stats: EngineStats::default(),
            shutdown: AtomicBool::new(false),
        });

        let (tx, rx): (Sender<Event>, Receiver<Event>) = crossbeam_channel::unbounded();

        let worker_shared = shared.clone();
        let workers = WorkerPool::spawn(
            "tidegate-worker",
            shared.config.resolved_workers(),
            shared.config.pin_threads,
            move |_index| {
                // The queue is MPMC; every worker pulls from the same
                // receiver until the poller drops the sender.
                while let Ok(event) = rx.recv() {
                    worker_shared.dispatch(event);
                }
            },
        )?;

        let poller_shared = shared.clone();
        let poller_thread = thread::Builder::new()
            .name("tidegate-poller".into())
            .spawn(move || poller_loop(poller_shared, tx))?;

        info!(workers = workers.len(), "engine started");
        Ok(Self {
            shared,
            poller_thread: Some(poller_thread),
            workers: Some(workers),
        })
    }

    /// A cloneable handle for use from handlers and other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Binds a listener; accepted sockets report to `handler`.
    pub fn listen(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
    ) -> NetResult<Arc<Listener>> {
        self.handle().listen(addr, handler)
    }

    /// Starts an outbound connection reporting to `handler`.
    pub fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
    ) -> NetResult<Arc<Socket>> {
        self.handle().connect(addr, handler)
    }

    /// Queues a framed message for `socket`.
    pub fn send(&self, socket: &Arc<Socket>, payload: &[u8]) -> NetResult<()> {
        self.handle().send(socket, payload)
    }

    /// Closes `socket`.
    pub fn close(&self, socket: &Arc<Socket>) {
        self.handle().close(socket)
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Stops the poller and workers, closes every remaining handle and
    /// returns all buffers to the pool. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.poller.wake() {
            warn!(error = %e, "wake during shutdown failed");
        }
        if let Some(handle) = self.poller_thread.take() {
            let _ = handle.join();
        }
        // The poller dropped the event sender on exit, so the workers
        // drain the queue and stop.
        if let Some(workers) = self.workers.take() {
            workers.join();
        }

        for entry in self.shared.manager.drain_entries() {
            match entry {
                Registered::Listener(listener, _) => listener.close(),
                Registered::Socket(socket, handler) => {
                    if socket.close(&self.shared.poller) {
                        handler.on_closed(&socket);
                    }
                    socket.mark_pending_free();
                    socket.release_buffers();
                }
            }
        }
        self.shared.manager.drain_pending();
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineHandle {
    /// Binds a listener; accepted sockets report to `handler`.
    pub fn listen(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
    ) -> NetResult<Arc<Listener>> {
        let shared = &self.shared;
        let id = shared.manager.next_id();
        let listener = Arc::new(Listener::bind(id, addr, shared.config.accept_backlog)?);
        shared
            .manager
            .insert_listener(listener.clone(), handler)
            .map_err(|_| NetError::Capacity {
                kind: "listener",
                max: shared.config.max_listeners,
            })?;
        shared
            .poller
            .arm(listener.fd(), id, Interest::READABLE)
            .map_err(NetError::Registration)?;
        Ok(listener)
    }

    /// Starts a non-blocking outbound connection. `on_connected` fires once
    /// the handshake completes, which may happen before this returns.
    pub fn connect(
        &self,
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
    ) -> NetResult<Arc<Socket>> {
        let shared = &self.shared;
        let (fd, immediate) = connect_nonblocking(addr)?;
        let id = shared.manager.next_id();
        let socket = Arc::new(Socket::new(
            id,
            fd,
            Some(addr),
            shared.config.clone(),
            shared.pools.clone(),
        ));
        socket.try_transition(SocketState::Idle, SocketState::Connecting);

        if let Err(rejected) = shared.manager.insert_socket(socket.clone(), handler.clone()) {
            let _ = rejected.close(&shared.poller);
            return Err(NetError::Capacity {
                kind: "socket",
                max: shared.config.max_sockets,
            });
        }

        if immediate {
            socket.try_transition(SocketState::Connecting, SocketState::Connected);
            shared
                .stats
                .connections_opened
                .fetch_add(1, Ordering::Relaxed);
            debug!(id, peer = %addr, "connection established immediately");
            handler.on_connected(&socket);
            shared.rearm(&socket);
        } else {
            shared
                .poller
                .arm(fd, id, Interest::WRITABLE)
                .map_err(NetError::Registration)?;
        }
        Ok(socket)
    }

    /// Queues a framed message and schedules the flush. A message that
    /// would push the buffered amount past the send ceiling closes the
    /// connection and reports the overrun.
    pub fn send(&self, socket: &Arc<Socket>, payload: &[u8]) -> NetResult<()> {
        if !socket.is_open() {
            return Err(NetError::Closed);
        }
        match socket.with_send_pipeline(|p| p.queue_message(payload)) {
            Ok(()) => {}
            Err(e @ NetError::SendOverrun { .. }) => {
                warn!(id = socket.id(), error = %e, "slow consumer disconnected");
                self.shared.close_lookup(socket);
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.shared
            .stats
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        self.shared.rearm(socket);
        Ok(())
    }

    /// Queues bytes verbatim: no frame header, no compression, no
    /// encryption. Only valid before any framed traffic has been queued
    /// on the socket.
    pub fn send_raw(&self, socket: &Arc<Socket>, bytes: &[u8]) -> NetResult<()> {
        if !socket.is_open() {
            return Err(NetError::Closed);
        }
        socket.with_send_pipeline(|p| p.queue_raw(bytes))?;
        self.shared.rearm(socket);
        Ok(())
    }

    /// Marks the next `n` inbound bytes on `socket` as raw: they bypass
    /// the transforms and arrive via [`EventHandler::on_raw`], then
    /// framing resumes.
    pub fn expect_raw(&self, socket: &Arc<Socket>, n: usize) {
        socket.with_recv_pipeline(|p| p.set_raw_passthrough(n));
    }

    /// Closes `socket`. Safe to call repeatedly and from handlers.
    pub fn close(&self, socket: &Arc<Socket>) {
        self.shared.close_lookup(socket);
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

/// Blocks in the multiplexer and feeds ready events to the workers.
/// Also the housekeeping tick: reaps the delayed-release queue and
/// re-checks throttled sockets once per wakeup.
fn poller_loop(shared: Arc<EngineShared>, sender: Sender<Event>) {
    let mut events = Vec::with_capacity(256);
    while !shared.shutdown.load(Ordering::Acquire) {
        events.clear();
        if let Err(e) = shared
            .poller
            .wait(&mut events, Some(shared.config.poll_timeout))
        {
            error!(error = %e, "multiplexer wait failed, stopping poller");
            break;
        }
        for event in events.drain(..) {
            if sender.send(event).is_err() {
                return;
            }
        }
        shared.manager.reap(Instant::now());
        shared.resume_throttled();
    }
}

impl EngineShared {
    /// Routes one readiness event. Tokens that resolve to nothing belong
    /// to sockets retired between the wait call and now.
    fn dispatch(&self, event: Event) {
        let Some(entry) = self.manager.lookup(event.token) else {
            return;
        };
        match entry {
            Registered::Listener(listener, handler) => self.accept_pass(&listener, &handler),
            Registered::Socket(socket, handler) => {
                if event.is_error {
                    debug!(id = socket.id(), "error condition reported, closing");
                    self.close_socket(&socket, &handler);
                    return;
                }
                // Writable first: connect completion must precede reads.
                if event.writable && !self.handle_writable(&socket, &handler) {
                    return;
                }
                if event.readable && !self.handle_readable(&socket, &handler) {
                    return;
                }
                self.rearm(&socket);
            }
        }
    }

    /// Drains the listener backlog, then re-arms the one-shot listener
    /// registration.
    fn accept_pass(&self, listener: &Arc<Listener>, handler: &Arc<dyn EventHandler>) {
        loop {
            match listener.accept() {
                Ok(Some((fd, peer))) => {
                    let id = self.manager.next_id();
                    let socket = Arc::new(Socket::new(
                        id,
                        fd,
                        Some(peer),
                        self.config.clone(),
                        self.pools.clone(),
                    ));
                    socket.try_transition(SocketState::Idle, SocketState::Connected);

                    if let Err(rejected) = self.manager.insert_socket(socket.clone(), handler.clone())
                    {
                        let _ = rejected.close(&self.poller);
                        continue;
                    }
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(id, %peer, "connection accepted");
                    handler.on_connected(&socket);
                    self.rearm(&socket);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(id = listener.id(), error = %e, "accept failed");
                    break;
                }
            }
        }
        if let Err(e) = self
            .poller
            .arm(listener.fd(), listener.id(), Interest::READABLE)
        {
            error!(id = listener.id(), error = %e, "listener re-arm failed");
        }
    }

    /// Runs the receive pass behind the single-writer gate. Returns false
    /// when the socket was closed.
    fn handle_readable(&self, socket: &Arc<Socket>, handler: &Arc<dyn EventHandler>) -> bool {
        if !socket.try_arm_recv() {
            return true;
        }
        let result = self.recv_pass(socket, handler);
        socket.disarm_recv();

        match result {
            Ok(true) => true,
            Ok(false) => {
                debug!(id = socket.id(), "peer closed the connection");
                self.close_socket(socket, handler);
                false
            }
            Err(e) => {
                debug!(id = socket.id(), error = %e, "receive pass failed, closing");
                self.close_socket(socket, handler);
                false
            }
        }
    }

    /// Reads until the OS would block, ingesting into the receive pipeline
    /// and delivering every complete message. Returns `Ok(false)` on EOF.
    fn recv_pass(&self, socket: &Arc<Socket>, handler: &Arc<dyn EventHandler>) -> NetResult<bool> {
        let mut chunk = vec![0u8; self.config.read_chunk_size];
        loop {
            match socket.read_chunk(&mut chunk) {
                Ok(0) => {
                    self.deliver(socket, handler)?;
                    return Ok(false);
                }
                Ok(n) => {
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    socket.with_recv_pipeline(|p| p.ingest(&chunk[..n]))?;
                    self.deliver(socket, handler)?;
                    if socket.with_recv_pipeline(|p| p.over_limit()) {
                        // Backpressure: the rearm step parks the socket
                        // instead of re-registering readable interest.
                        return Ok(true);
                    }
                    if n < chunk.len() {
                        return Ok(true);
                    }
                }
                Err(e) if is_retriable(&e) => return Ok(true),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hands buffered raw-passthrough bytes and then every complete
    /// message to the handler. The pipeline lock is released before each
    /// callback.
    fn deliver(&self, socket: &Arc<Socket>, handler: &Arc<dyn EventHandler>) -> NetResult<()> {
        loop {
            if let Some(raw) = socket.with_recv_pipeline(|p| p.take_raw()) {
                handler.on_raw(socket, raw);
                continue;
            }
            let message = socket.with_recv_pipeline(|p| p.next_message())?;
            match message {
                Some(payload) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    handler.on_message(socket, payload);
                }
                None => return Ok(()),
            }
        }
    }

    /// Completes an in-flight connect and flushes queued bytes. Returns
    /// false when the socket was closed.
    fn handle_writable(&self, socket: &Arc<Socket>, handler: &Arc<dyn EventHandler>) -> bool {
        if socket.state() == SocketState::Connecting {
            match socket.take_connect_error() {
                Ok(()) => {
                    if socket.try_transition(SocketState::Connecting, SocketState::Connected) {
                        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
                        debug!(id = socket.id(), peer = ?socket.peer_addr(), "connection established");
                        handler.on_connected(socket);
                    }
                }
                Err(e) => {
                    debug!(id = socket.id(), error = %e, "connect failed");
                    self.close_socket(socket, handler);
                    return false;
                }
            }
        }

        if socket.send_pending() == 0 || !socket.try_arm_send() {
            return true;
        }
        let result = self.send_pass(socket);
        socket.disarm_send();

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(id = socket.id(), error = %e, "send pass failed, closing");
                self.close_socket(socket, handler);
                false
            }
        }
    }

    /// Applies the wire transforms to queued bytes and writes until the OS
    /// would block.
    fn send_pass(&self, socket: &Arc<Socket>) -> NetResult<()> {
        let written = socket.with_send_pipeline(|p| {
            p.prepare_wire()?;
            p.drain_wire(|span| match socket.write_chunk(span) {
                Ok(n) => Ok(n),
                Err(e) if is_retriable(&e) => Ok(0),
                Err(e) => Err(e.into()),
            })
        })?;
        self.stats
            .bytes_sent
            .fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Recomputes the socket's interest and re-arms the one-shot
    /// registration. The registration lock serializes this with every
    /// other arm attempt, so whichever call lands last saw the latest
    /// queue state.
    fn rearm(&self, socket: &Arc<Socket>) {
        let arm_result = {
            let _guard = socket.registration_guard();
            if !socket.is_open() {
                return;
            }
            let throttled = socket.with_recv_pipeline(|p| p.over_limit());
            if throttled {
                self.manager.park_throttled(socket.clone());
            }
            let interest = Interest {
                readable: !throttled,
                writable: socket.send_pending() > 0,
            };
            if !interest.readable && !interest.writable {
                return;
            }
            self.poller.arm(socket.fd(), socket.id(), interest)
        };

        if let Err(e) = arm_result {
            debug!(id = socket.id(), error = %e, "re-arm failed, closing");
            self.close_lookup(socket);
        }
    }

    /// Re-checks parked sockets; any that drained below the receive
    /// ceiling are re-armed, the rest are parked again by `rearm`.
    fn resume_throttled(&self) {
        for socket in self.manager.take_throttled() {
            if socket.is_open() {
                self.rearm(&socket);
            }
        }
    }

    /// Closes `socket` and retires it. Only the first caller runs the
    /// close; `on_closed` therefore fires at most once.
    fn close_socket(&self, socket: &Arc<Socket>, handler: &Arc<dyn EventHandler>) {
        if socket.close(&self.poller) {
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            handler.on_closed(socket);
            self.manager.retire(socket.clone());
        }
    }

    /// Closes `socket`, resolving its handler through the manager table.
    fn close_lookup(&self, socket: &Arc<Socket>) {
        match self.manager.lookup(socket.id()) {
            Some(Registered::Socket(_, handler)) => self.close_socket(socket, &handler),
            _ => {
                // Already retired; close the handle if somehow still open.
                if socket.close(&self.poller) {
                    self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    self.manager.retire(socket.clone());
                }
            }
        }
    }
}
