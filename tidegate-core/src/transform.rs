//! Byte-stream transforms: encryption hooks and compression helpers.
//!
//! Encryption is a caller-supplied in-place transform applied symmetrically
//! on both ends of a connection. Compression packs bytes into
//! self-delimiting deflate units, each prefixed with a 4-byte little-endian
//! length of the compressed payload.

use crate::error::{NetError, NetResult};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// An in-place byte transform. Implementations may be stateful: the engine
/// feeds each direction's bytes through its transform exactly once and in
/// stream order, so a position-dependent cipher stays aligned with its peer
/// regardless of how the stream is split into spans.
pub trait Transform: Send {
    /// Transforms `data` in place.
    fn apply(&mut self, data: &mut [u8]);
}

/// The default transform: repeating-key XOR carrying a stream offset.
pub struct XorTransform {
    key: Vec<u8>,
    pos: u64,
}

impl XorTransform {
    /// Creates a transform with the given repeating key.
    ///
    /// An empty key is rejected by config validation before it gets here;
    /// a single-byte key degenerates to a constant mask.
    pub fn new(key: Vec<u8>) -> Self {
        debug_assert!(!key.is_empty());
        Self { key, pos: 0 }
    }
}

impl Transform for XorTransform {
    fn apply(&mut self, data: &mut [u8]) {
        let key_len = self.key.len() as u64;
        for byte in data.iter_mut() {
            *byte ^= self.key[(self.pos % key_len) as usize];
            self.pos += 1;
        }
    }
}

/// Length of the per-unit header prepended to compressed payloads.
pub const UNIT_HEADER_LEN: usize = 4;

/// Deflates `input` and appends one self-delimiting unit
/// (`[4-byte LE compressed length][compressed bytes]`) to `out`.
pub fn deflate_unit(input: &[u8], out: &mut Vec<u8>) -> NetResult<()> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    let compressed = encoder.finish()?;

    let len = u32::try_from(compressed.len())
        .map_err(|_| NetError::Protocol("compressed unit exceeds u32".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(())
}

/// Inflates one unit's compressed payload (header already stripped).
/// Fails with a protocol error when the inflated size exceeds `max_out`,
/// since a well-behaved peer never packs more than one bounded frame chunk
/// per unit.
pub fn inflate_unit(compressed: &[u8], max_out: usize) -> NetResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut out = Vec::new();
    let read = decoder
        .by_ref()
        .take(max_out as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| NetError::Protocol(format!("inflate failed: {}", e)))?;

    if read > max_out {
        return Err(NetError::Protocol(format!(
            "inflated unit of more than {} bytes",
            max_out
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_round_trip_across_uneven_spans() {
        let key = vec![0x13, 0x57, 0x9b];
        let mut enc = XorTransform::new(key.clone());
        let mut dec = XorTransform::new(key);

        let original: Vec<u8> = (0u8..=200).collect();
        let mut wire = original.clone();

        // Encrypt in uneven chunks, decrypt in different uneven chunks.
        let (a, b) = wire.split_at_mut(7);
        enc.apply(a);
        enc.apply(b);

        let (c, rest) = wire.split_at_mut(100);
        let (d, e) = rest.split_at_mut(1);
        dec.apply(c);
        dec.apply(d);
        dec.apply(e);

        assert_eq!(wire, original);
    }

    #[test]
    fn test_xor_actually_changes_bytes() {
        let mut enc = XorTransform::new(vec![0xff]);
        let mut data = vec![0u8; 8];
        enc.apply(&mut data);
        assert_eq!(data, vec![0xff; 8]);
    }

    #[test]
    fn test_deflate_inflate_unit() {
        let input = b"the same phrase repeated, the same phrase repeated".to_vec();
        let mut unit = Vec::new();
        deflate_unit(&input, &mut unit).unwrap();

        let len = u32::from_le_bytes(unit[..4].try_into().unwrap()) as usize;
        assert_eq!(len, unit.len() - UNIT_HEADER_LEN);

        let out = inflate_unit(&unit[4..], 1024).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_inflate_rejects_oversized_output() {
        let input = vec![0u8; 4096];
        let mut unit = Vec::new();
        deflate_unit(&input, &mut unit).unwrap();

        let err = inflate_unit(&unit[4..], 100).unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }

    #[test]
    fn test_empty_unit_round_trips() {
        let mut unit = Vec::new();
        deflate_unit(&[], &mut unit).unwrap();
        let out = inflate_unit(&unit[4..], 16).unwrap();
        assert!(out.is_empty());
    }
}
