//! Buffered I/O pipeline.
//!
//! This module is responsible for:
//! - Fixed-capacity byte blocks with read/write/transform cursors
//! - Block chains forming unbounded per-socket byte streams
//! - The per-direction pipeline doing framing, compression and encryption

mod block;
mod chain;
mod pipeline;

pub use block::Block;
pub use chain::BlockChain;
pub use pipeline::{Direction, Pipeline, COMPRESS_CHUNK};
