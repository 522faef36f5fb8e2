//! Engine configuration.
//!
//! All tunables live in one [`EngineConfig`] passed to
//! [`Engine::start`](crate::engine::Engine::start). Defaults are chosen for
//! a mid-sized server; tests shrink the pools and the grace period.

use crate::error::{NetError, NetResult};
use std::time::Duration;

/// Configuration for the socket engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of a small buffer block in bytes.
    pub small_block_size: usize,

    /// Number of small blocks the pool may hand out.
    pub small_block_count: usize,

    /// Size of a big buffer block in bytes. Used when a single push
    /// carries more bytes than a small block holds.
    pub big_block_size: usize,

    /// Number of big blocks the pool may hand out.
    pub big_block_count: usize,

    /// Maximum number of live sockets tracked by the manager.
    pub max_sockets: usize,

    /// Maximum number of live listeners.
    pub max_listeners: usize,

    /// Number of worker threads. Zero means one per host CPU.
    pub worker_threads: usize,

    /// Whether to pin worker threads to CPU cores.
    pub pin_threads: bool,

    /// Receive-side byte ceiling per socket. Once the buffered amount
    /// meets this, readiness re-arming is skipped until it drains. Must
    /// be at least `max_message_size` so a single frame always fits.
    pub recv_buffer_limit: usize,

    /// Send-side byte ceiling per socket. Queuing past this closes the
    /// connection (slow-consumer policy).
    pub send_buffer_limit: usize,

    /// Upper bound on a framed message, length field included. A declared
    /// length outside `4..max_message_size` closes the connection.
    pub max_message_size: usize,

    /// Enable deflate compression of the byte stream.
    pub enable_compression: bool,

    /// Enable the encryption transform on the byte stream.
    pub enable_encryption: bool,

    /// Repeating key for the default XOR transform, used when
    /// `enable_encryption` is set and no custom transform is installed.
    pub xor_key: Vec<u8>,

    /// Strip a legacy proxy header (`\r\n\r\n`-terminated) from the start
    /// of each receive stream.
    pub strip_proxy_header: bool,

    /// Delay between releasing a closed socket and returning its buffers
    /// to the pool.
    pub grace_period: Duration,

    /// Bytes read from a socket per read call.
    pub read_chunk_size: usize,

    /// Listen backlog passed to the OS.
    pub accept_backlog: i32,

    /// Maximum time the poller blocks in one wait call.
    pub poll_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            small_block_size: 4 * 1024,   // 4 KiB
            small_block_count: 1024,
            big_block_size: 64 * 1024,    // 64 KiB
            big_block_count: 64,
            max_sockets: 1024,
            max_listeners: 16,
            worker_threads: 0,
            pin_threads: true,
            recv_buffer_limit: 2 * 1024 * 1024,  // 2 MiB
            send_buffer_limit: 4 * 1024 * 1024,  // 4 MiB
            max_message_size: 256 * 1024,        // 256 KiB
            enable_compression: false,
            enable_encryption: false,
            xor_key: vec![0x5a, 0xc3, 0x17, 0x8e],
            strip_proxy_header: false,
            grace_period: Duration::from_secs(30),
            read_chunk_size: 64 * 1024,   // 64 KiB
            accept_backlog: 128,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Resolves the worker thread count, treating zero as "one per CPU".
    pub fn resolved_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> NetResult<()> {
        if self.small_block_size == 0 || self.big_block_size == 0 {
            return Err(NetError::Protocol("block size must be non-zero".into()));
        }
        if self.big_block_size < self.small_block_size {
            return Err(NetError::Protocol(
                "big blocks must be at least as large as small blocks".into(),
            ));
        }
        if self.max_message_size <= 4 {
            return Err(NetError::Protocol(
                "max_message_size must exceed the 4-byte length field".into(),
            ));
        }
        if self.recv_buffer_limit < self.max_message_size {
            // A throttled socket stops reading entirely. If the ceiling
            // cannot hold one maximal frame, a legal frame split across
            // reads would park the socket forever.
            return Err(NetError::Protocol(
                "recv_buffer_limit must be at least max_message_size".into(),
            ));
        }
        if self.enable_encryption && self.xor_key.is_empty() {
            return Err(NetError::Protocol("xor_key must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.resolved_workers() >= 1);
    }

    #[test]
    fn test_zero_workers_resolves_to_cpu_count() {
        let config = EngineConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert_eq!(config.resolved_workers(), num_cpus::get());

        let fixed = EngineConfig {
            worker_threads: 3,
            ..Default::default()
        };
        assert_eq!(fixed.resolved_workers(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.max_message_size = 4;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.big_block_size = config.small_block_size - 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.enable_encryption = true;
        config.xor_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_recv_limit_must_cover_a_full_frame() {
        let mut config = EngineConfig::default();
        config.recv_buffer_limit = config.max_message_size - 1;
        assert!(config.validate().is_err());

        // A partial frame holds at most max_message_size - 1 bytes, so an
        // equal ceiling never stalls mid-frame.
        config.recv_buffer_limit = config.max_message_size;
        config.validate().unwrap();
    }
}
