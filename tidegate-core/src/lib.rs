//! Tidegate Core - Asynchronous TCP engine
//!
//! This library provides a readiness-driven socket engine: a dedicated
//! poller thread multiplexes non-blocking sockets, a pinned worker pool
//! runs the I/O passes, and each socket carries a pooled buffer pipeline
//! that frames, optionally compresses and optionally encrypts the byte
//! stream.

/// Buffer blocks, chains and the framing pipeline
pub mod buffer;

/// Engine configuration
pub mod config;

/// Engine, worker pool and socket manager
pub mod engine;

/// Error types
pub mod error;

/// Listening sockets
pub mod listener;

/// Readiness multiplexer (epoll/kqueue)
pub mod poll;

/// Pooled buffer blocks
pub mod pool;

/// Socket lifecycle
pub mod socket;

/// Byte-stream transforms (XOR, deflate)
pub mod transform;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, EventHandler, StatsSnapshot};
pub use error::{NetError, NetResult};
pub use listener::Listener;
pub use socket::{Socket, SocketId, SocketState};
