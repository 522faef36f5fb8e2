//! Buffer pipeline: bridges raw socket bytes and framed messages.
//!
//! Each socket owns one pipeline per direction. A pipeline holds two block
//! chains: `io` closest to the wire and `logical` closest to the
//! application. Depending on configuration, bytes pass through deflate
//! compression (self-delimiting length-prefixed units) and an in-place
//! encryption transform between the two, with 4-byte little-endian length
//! framing delimiting application messages on the logical side.
//!
//! Wire layout per direction: `encrypt(compress(frame(payload)))`. The
//! receive side undoes the layers outermost first.

use crate::buffer::BlockChain;
use crate::error::{NetError, NetResult};
use crate::pool::BufferPools;
use crate::transform::{deflate_unit, inflate_unit, Transform};
use std::sync::Arc;
use tracing::trace;

/// Bytes of logical stream packed into one compressed unit. Both ends of a
/// connection use the same bound, so it also caps the inflated size of a
/// well-formed incoming unit.
pub const COMPRESS_CHUNK: usize = 64 * 1024; // 64 KiB

/// Sanity ceiling for a declared compressed-unit length: deflate adds only
/// a few bytes of overhead per chunk, so anything past this is a protocol
/// violation rather than data.
const COMPRESSED_UNIT_CEILING: usize = COMPRESS_CHUNK + 256;

/// Bytes of the message length field.
const FRAME_HEADER_LEN: usize = 4;

/// Terminator of the legacy proxy header.
const PROXY_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Which way bytes flow through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Application messages out to the wire.
    Send,
    /// Wire bytes in to the application.
    Receive,
}

/// Message-framing state on the logical chain. Either we are waiting for a
/// complete 4-byte length field, or for the body it declared, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Waiting for the 4-byte length field.
    AwaitLength,
    /// Waiting for this many body bytes.
    AwaitBody(usize),
}

/// One-shot scan for the legacy proxy header at stream start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    /// Scanning disabled or already finished.
    Off,
    /// Still discarding; the value counts terminator bytes matched so far.
    Scanning(usize),
}

/// Per-direction buffer pipeline.
pub struct Pipeline {
    direction: Direction,

    /// Chain closest to the wire (holds compressed/encrypted bytes when
    /// compression is on).
    io: BlockChain,

    /// Chain closest to the application (framed plaintext).
    logical: BlockChain,

    /// Whether this direction compresses (send) / decompresses (receive).
    compress: bool,

    /// In-place encryption (send) / decryption (receive) transform.
    transform: Option<Box<dyn Transform>>,

    /// Bytes at stream start exempt from every transform.
    raw_passthrough: usize,

    /// Exempt bytes already buffered on the logical chain but not yet
    /// handed to the application. Framing waits until these drain.
    raw_pending: usize,

    /// Byte ceiling for this direction (backpressure).
    byte_limit: usize,

    /// Upper bound on a framed message, length field included.
    max_message_size: usize,

    frame: FrameState,

    /// Declared length of the compressed unit currently awaited.
    pending_unit: Option<usize>,

    proxy: ProxyState,
}

impl Pipeline {
    /// Creates a receive-direction pipeline.
    pub fn receiver(pools: Arc<BufferPools>, max_message_size: usize, byte_limit: usize) -> Self {
        Self::new(Direction::Receive, pools, max_message_size, byte_limit)
    }

    /// Creates a send-direction pipeline.
    pub fn sender(pools: Arc<BufferPools>, max_message_size: usize, byte_limit: usize) -> Self {
        Self::new(Direction::Send, pools, max_message_size, byte_limit)
    }

    fn new(
        direction: Direction,
        pools: Arc<BufferPools>,
        max_message_size: usize,
        byte_limit: usize,
    ) -> Self {
        Self {
            direction,
            io: BlockChain::new(pools.clone()),
            logical: BlockChain::new(pools),
            compress: false,
            transform: None,
            raw_passthrough: 0,
            raw_pending: 0,
            byte_limit,
            max_message_size,
            frame: FrameState::AwaitLength,
            pending_unit: None,
            proxy: ProxyState::Off,
        }
    }

    /// Enables compression (send) or decompression (receive).
    pub fn enable_compression(&mut self) {
        self.compress = true;
    }

    /// Installs the encryption/decryption transform for this direction.
    pub fn set_transform(&mut self, transform: Box<dyn Transform>) {
        self.transform = Some(transform);
    }

    /// Exempts the next `n` stream bytes from every transform. Used for
    /// out-of-band protocol headers exchanged once per connection.
    pub fn set_raw_passthrough(&mut self, n: usize) {
        self.raw_passthrough = n;
    }

    /// Enables the one-shot legacy proxy-header strip (receive side only).
    pub fn enable_proxy_strip(&mut self) {
        debug_assert_eq!(self.direction, Direction::Receive);
        self.proxy = ProxyState::Scanning(0);
    }

    /// Total bytes buffered across both chains.
    pub fn buffered(&self) -> usize {
        self.io.datasize() + self.logical.datasize()
    }

    /// True when the buffered amount has reached the direction's ceiling.
    pub fn over_limit(&self) -> bool {
        self.buffered() >= self.byte_limit
    }

    // ---- receive path ------------------------------------------------

    /// Accepts raw bytes read from the socket: strips the proxy header,
    /// honours raw passthrough, decrypts in place and inflates complete
    /// compressed units into the logical chain.
    pub fn ingest(&mut self, data: &[u8]) -> NetResult<()> {
        debug_assert_eq!(self.direction, Direction::Receive);
        let mut data = self.strip_proxy(data);

        // Passthrough bytes skip both transforms.
        if self.raw_passthrough > 0 && !data.is_empty() {
            let take = self.raw_passthrough.min(data.len());
            self.logical.push(&data[..take])?;
            // Mark the passthrough span as already transformed so a later
            // decrypt pass over the chain cannot touch it.
            self.logical.transform_pending(|_| {});
            self.raw_passthrough -= take;
            self.raw_pending += take;
            data = &data[take..];
        }

        if data.is_empty() {
            return Ok(());
        }

        // Without decompression the wire bytes land directly on the
        // logical chain; decryption tracks them via the transform cursor
        // either way.
        let arrival = if self.compress { &self.io } else { &self.logical };
        arrival.push(data)?;
        if let Some(transform) = self.transform.as_mut() {
            arrival.transform_pending(|span| transform.apply(span));
        }

        if self.compress {
            self.pump_units()?;
        }
        Ok(())
    }

    /// Discards bytes up to and including the `\r\n\r\n` terminator while
    /// the one-shot scan is active.
    fn strip_proxy<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let ProxyState::Scanning(mut matched) = self.proxy else {
            return data;
        };

        for (idx, byte) in data.iter().enumerate() {
            if *byte == PROXY_TERMINATOR[matched] {
                matched += 1;
                if matched == PROXY_TERMINATOR.len() {
                    self.proxy = ProxyState::Off;
                    trace!("stripped legacy proxy header");
                    return &data[idx + 1..];
                }
            } else if *byte == PROXY_TERMINATOR[0] {
                matched = 1;
            } else {
                matched = 0;
            }
        }

        self.proxy = ProxyState::Scanning(matched);
        &[]
    }

    /// Moves every complete compressed unit from the io chain to the
    /// logical chain, inflating as it goes.
    fn pump_units(&mut self) -> NetResult<()> {
        loop {
            let unit_len = match self.pending_unit {
                Some(len) => len,
                None => {
                    let Some(header) = self.io.read_bytes(FRAME_HEADER_LEN) else {
                        return Ok(());
                    };
                    let len = u32::from_le_bytes(
                        header.try_into().unwrap_or_else(|_| unreachable!()),
                    ) as usize;
                    if len == 0 || len > COMPRESSED_UNIT_CEILING {
                        return Err(NetError::Protocol(format!(
                            "compressed unit of {} bytes declared",
                            len
                        )));
                    }
                    self.pending_unit = Some(len);
                    len
                }
            };

            let Some(unit) = self.io.read_bytes(unit_len) else {
                return Ok(());
            };
            self.pending_unit = None;
            let plain = inflate_unit(&unit, COMPRESS_CHUNK)?;
            self.logical.push(&plain)?;
        }
    }

    /// Hands out buffered raw-passthrough bytes, possibly a partial span
    /// when the window arrived split. `None` once the window has drained
    /// (or none was configured); framing takes over from there.
    pub fn take_raw(&mut self) -> Option<Vec<u8>> {
        debug_assert_eq!(self.direction, Direction::Receive);
        if self.raw_pending == 0 {
            return None;
        }
        let n = self.raw_pending.min(self.logical.datasize());
        if n == 0 {
            return None;
        }
        let bytes = self.logical.read_bytes(n)?;
        self.raw_pending -= n;
        Some(bytes)
    }

    /// Extracts the next complete framed message from the logical chain.
    ///
    /// Returns `Ok(None)` while the frame is incomplete or while raw
    /// passthrough bytes are still queued ahead of it. A declared length
    /// outside `4..max_message_size` is a protocol violation: the caller
    /// closes the connection instead of retrying.
    pub fn next_message(&mut self) -> NetResult<Option<Vec<u8>>> {
        debug_assert_eq!(self.direction, Direction::Receive);
        if self.raw_pending > 0 {
            // The head of the logical chain is raw bytes, not a frame.
            return Ok(None);
        }
        loop {
            match self.frame {
                FrameState::AwaitLength => {
                    let Some(header) = self.logical.read_bytes(FRAME_HEADER_LEN) else {
                        return Ok(None);
                    };
                    let declared = u32::from_le_bytes(
                        header.try_into().unwrap_or_else(|_| unreachable!()),
                    ) as usize;
                    if declared < FRAME_HEADER_LEN || declared >= self.max_message_size {
                        return Err(NetError::Protocol(format!(
                            "frame length {} outside 4..{}",
                            declared, self.max_message_size
                        )));
                    }
                    if declared == FRAME_HEADER_LEN {
                        // Zero-byte payload is a legal message.
                        return Ok(Some(Vec::new()));
                    }
                    self.frame = FrameState::AwaitBody(declared - FRAME_HEADER_LEN);
                }
                FrameState::AwaitBody(body_len) => {
                    let Some(payload) = self.logical.read_bytes(body_len) else {
                        return Ok(None);
                    };
                    self.frame = FrameState::AwaitLength;
                    return Ok(Some(payload));
                }
            }
        }
    }

    // ---- send path ---------------------------------------------------

    /// Frames `payload` and queues it on the logical chain.
    ///
    /// A message whose framed size reaches `max_message_size` is rejected
    /// here, before any byte could reach the wire. Queuing past the byte
    /// ceiling reports an overrun; the engine closes the slow connection.
    pub fn queue_message(&mut self, payload: &[u8]) -> NetResult<()> {
        debug_assert_eq!(self.direction, Direction::Send);
        let framed = payload.len() + FRAME_HEADER_LEN;
        if framed >= self.max_message_size {
            return Err(NetError::TooLarge {
                size: framed,
                max: self.max_message_size,
            });
        }

        let buffered = self.buffered();
        if buffered + framed > self.byte_limit {
            return Err(NetError::SendOverrun {
                buffered,
                limit: self.byte_limit,
            });
        }

        self.logical.push(&(framed as u32).to_le_bytes())?;
        self.logical.push(payload)?;
        Ok(())
    }

    /// Queues bytes that bypass framing and every transform: the sending
    /// half of raw passthrough, for out-of-band headers exchanged at
    /// connection start. Must be called before any message is queued.
    pub fn queue_raw(&mut self, bytes: &[u8]) -> NetResult<()> {
        debug_assert_eq!(self.direction, Direction::Send);
        debug_assert_eq!(self.buffered(), 0);
        let wire = self.wire_chain();
        wire.push(bytes)?;
        wire.transform_pending(|_| {});
        Ok(())
    }

    /// Runs pending logical bytes through compression and/or encryption so
    /// they are ready to drain to the socket. Must run before
    /// [`drain_wire`](Self::drain_wire) in the same pass.
    pub fn prepare_wire(&mut self) -> NetResult<()> {
        debug_assert_eq!(self.direction, Direction::Send);
        if self.compress {
            while self.logical.datasize() > 0 {
                let take = self.logical.datasize().min(COMPRESS_CHUNK);
                let Some(chunk) = self.logical.read_bytes(take) else {
                    break;
                };
                let mut unit = Vec::with_capacity(chunk.len() / 2 + FRAME_HEADER_LEN);
                deflate_unit(&chunk, &mut unit)?;
                self.io.push(&unit)?;
            }
        }

        // Encryption runs in place on the wire-side chain, before any byte
        // is read for the socket.
        if let Some(transform) = self.transform.as_mut() {
            let wire = if self.compress { &self.io } else { &self.logical };
            wire.transform_pending(|span| transform.apply(span));
        }
        Ok(())
    }

    /// Feeds wire-ready spans to the socket writer `f` (which returns how
    /// many bytes the OS accepted). Returns total bytes written.
    pub fn drain_wire(&self, f: impl FnMut(&[u8]) -> NetResult<usize>) -> NetResult<usize> {
        self.wire_chain().drain_with(f)
    }

    /// True while any byte in this direction still awaits the wire.
    pub fn has_pending(&self) -> bool {
        self.buffered() > 0
    }

    fn wire_chain(&self) -> &BlockChain {
        if self.compress {
            &self.io
        } else {
            &self.logical
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::XorTransform;

    const MAX_MSG: usize = 64 * 1024;
    const LIMIT: usize = 1024 * 1024;

    fn pools() -> Arc<BufferPools> {
        Arc::new(BufferPools::new(256, 512, 4096, 64))
    }

    fn pair(compress: bool, encrypt: bool) -> (Pipeline, Pipeline) {
        let key = vec![0x42, 0x9d, 0x03];
        let mut tx = Pipeline::sender(pools(), MAX_MSG, LIMIT);
        let mut rx = Pipeline::receiver(pools(), MAX_MSG, LIMIT);
        if compress {
            tx.enable_compression();
            rx.enable_compression();
        }
        if encrypt {
            tx.set_transform(Box::new(XorTransform::new(key.clone())));
            rx.set_transform(Box::new(XorTransform::new(key)));
        }
        (tx, rx)
    }

    fn wire_bytes(tx: &mut Pipeline) -> Vec<u8> {
        tx.prepare_wire().unwrap();
        let mut wire = Vec::new();
        tx.drain_wire(|span| {
            wire.extend_from_slice(span);
            Ok(span.len())
        })
        .unwrap();
        wire
    }

    #[test]
    fn test_round_trip_all_transform_combinations() {
        for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
            let (mut tx, mut rx) = pair(compress, encrypt);
            let messages: Vec<Vec<u8>> = vec![
                b"hello".to_vec(),
                Vec::new(),
                vec![0xaa; 10_000],
                (0u8..=255).collect(),
            ];

            for msg in &messages {
                tx.queue_message(msg).unwrap();
            }
            let wire = wire_bytes(&mut tx);
            assert!(!tx.has_pending());

            // Deliver the wire bytes in awkward fragment sizes.
            for fragment in wire.chunks(13) {
                rx.ingest(fragment).unwrap();
            }

            for expected in &messages {
                let got = rx.next_message().unwrap().unwrap();
                assert_eq!(&got, expected, "compress={} encrypt={}", compress, encrypt);
            }
            assert!(rx.next_message().unwrap().is_none());
        }
    }

    #[test]
    fn test_zero_byte_payload_is_accepted() {
        let (mut tx, mut rx) = pair(false, false);
        tx.queue_message(&[]).unwrap();
        let wire = wire_bytes(&mut tx);
        assert_eq!(wire, 4u32.to_le_bytes());

        rx.ingest(&wire).unwrap();
        let msg = rx.next_message().unwrap().unwrap();
        assert!(msg.is_empty());
    }

    #[test]
    fn test_declared_length_out_of_range_is_fatal() {
        // Too small.
        let mut rx = Pipeline::receiver(pools(), MAX_MSG, LIMIT);
        rx.ingest(&3u32.to_le_bytes()).unwrap();
        assert!(matches!(rx.next_message(), Err(NetError::Protocol(_))));

        // At the maximum (the bound is exclusive).
        let mut rx = Pipeline::receiver(pools(), MAX_MSG, LIMIT);
        rx.ingest(&(MAX_MSG as u32).to_le_bytes()).unwrap();
        assert!(matches!(rx.next_message(), Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_oversize_send_rejected_at_construction() {
        let mut tx = Pipeline::sender(pools(), MAX_MSG, LIMIT);
        let payload = vec![0u8; MAX_MSG - FRAME_HEADER_LEN]; // framed == MAX_MSG
        let err = tx.queue_message(&payload).unwrap_err();
        assert!(matches!(err, NetError::TooLarge { .. }));
        // Nothing was queued, nothing can reach the wire.
        assert!(!tx.has_pending());

        // One byte under the bound is fine.
        let payload = vec![0u8; MAX_MSG - FRAME_HEADER_LEN - 1];
        tx.queue_message(&payload).unwrap();
    }

    #[test]
    fn test_send_overrun_reports_slow_consumer() {
        let mut tx = Pipeline::sender(pools(), MAX_MSG, 100);
        tx.queue_message(&[1u8; 50]).unwrap();
        let err = tx.queue_message(&[1u8; 60]).unwrap_err();
        assert!(matches!(err, NetError::SendOverrun { .. }));
    }

    #[test]
    fn test_recv_over_limit_throttles() {
        let mut rx = Pipeline::receiver(pools(), MAX_MSG, 64);
        assert!(!rx.over_limit());
        rx.ingest(&vec![0u8; 32]).unwrap();
        assert!(!rx.over_limit());
        rx.ingest(&vec![0u8; 32]).unwrap();
        assert!(rx.over_limit());
    }

    #[test]
    fn test_raw_passthrough_skips_transforms() {
        let (mut tx, mut rx) = pair(false, true);
        // Both ends agree on 8 plaintext header bytes before the encrypted
        // stream starts.
        rx.set_raw_passthrough(8);
        tx.queue_raw(b"HDR-0001").unwrap();
        tx.queue_message(b"secret").unwrap();

        let wire = wire_bytes(&mut tx);
        assert_eq!(&wire[..8], b"HDR-0001");

        // Deliver the window split across ingest calls. Framing stays
        // quiet until every raw byte has been taken.
        rx.ingest(&wire[..5]).unwrap();
        assert!(rx.next_message().unwrap().is_none());
        assert_eq!(rx.take_raw().unwrap(), b"HDR-0".to_vec());

        rx.ingest(&wire[5..]).unwrap();
        assert_eq!(rx.take_raw().unwrap(), b"001".to_vec());
        assert!(rx.take_raw().is_none());
        assert_eq!(rx.next_message().unwrap().unwrap(), b"secret");
    }

    #[test]
    fn test_proxy_header_stripped_once() {
        let (mut tx, mut rx) = pair(false, false);
        rx.enable_proxy_strip();

        tx.queue_message(b"after proxy").unwrap();
        let wire = wire_bytes(&mut tx);

        // Header split across ingest calls, terminator straddling the cut.
        let mut stream = b"PROXY TCP4 1.2.3.4\r\n\r".to_vec();
        rx.ingest(&stream).unwrap();
        assert!(rx.next_message().unwrap().is_none());

        stream = b"\n".to_vec();
        stream.extend_from_slice(&wire);
        rx.ingest(&stream).unwrap();
        assert_eq!(rx.next_message().unwrap().unwrap(), b"after proxy");

        // A second \r\n\r\n is payload now, not a header.
        tx.queue_message(b"\r\n\r\nstill data").unwrap();
        let wire = wire_bytes(&mut tx);
        rx.ingest(&wire).unwrap();
        assert_eq!(rx.next_message().unwrap().unwrap(), b"\r\n\r\nstill data");
    }

    #[test]
    fn test_corrupt_compressed_unit_is_fatal() {
        let (mut tx, mut rx) = pair(true, false);
        tx.queue_message(b"payload").unwrap();
        let mut wire = wire_bytes(&mut tx);

        // Flip bytes inside the compressed payload, past the unit header.
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        wire[last - 1] ^= 0xff;

        let result = rx.ingest(&wire).and_then(|_| rx.next_message());
        assert!(result.is_err());
    }

    #[test]
    fn test_absurd_unit_length_is_fatal() {
        let mut rx = Pipeline::receiver(pools(), MAX_MSG, LIMIT);
        rx.enable_compression();
        let err = rx.ingest(&u32::MAX.to_le_bytes()).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }
}
