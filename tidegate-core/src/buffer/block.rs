//! A single fixed-capacity buffer block.
//!
//! Blocks are the unit the pool hands out. Each one owns a contiguous byte
//! region and three cursors: `read` (oldest unconsumed byte), `write` (next
//! free byte) and `transform_pos` (how far an in-place encrypt/decrypt step
//! has advanced). The invariant `read <= transform_pos <= write <= capacity`
//! holds after every operation.

/// A fixed-capacity byte segment with read/write/transform cursors.
pub struct Block {
    /// Backing storage, allocated once and reused across pool cycles.
    data: Box<[u8]>,

    /// Offset of the next byte to be consumed.
    read: usize,

    /// Offset of the next byte to be written.
    write: usize,

    /// Offset up to which an in-place transform has been applied.
    transform_pos: usize,
}

impl Block {
    /// Creates a block with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            transform_pos: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of written but not yet consumed bytes.
    pub fn unread(&self) -> usize {
        self.write - self.read
    }

    /// Number of bytes still writable at the tail.
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write
    }

    /// The readable span: written bytes not yet consumed.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// The writable span at the tail of the block.
    pub fn writable(&mut self) -> &mut [u8] {
        let write = self.write;
        &mut self.data[write..]
    }

    /// The written span an in-place transform has not covered yet.
    pub fn untransformed(&mut self) -> &mut [u8] {
        let (from, to) = (self.transform_pos, self.write);
        &mut self.data[from..to]
    }

    /// Advances the read cursor after consuming `n` bytes.
    pub fn advance_read(&mut self, n: usize) {
        self.read += n;
        debug_assert!(self.read <= self.write);
        // Bytes behind the read cursor count as transformed.
        if self.transform_pos < self.read {
            self.transform_pos = self.read;
        }
    }

    /// Advances the write cursor after filling `n` bytes of the writable span.
    pub fn advance_write(&mut self, n: usize) {
        self.write += n;
        debug_assert!(self.write <= self.data.len());
    }

    /// Advances the transform cursor after transforming `n` bytes in place.
    pub fn advance_transform(&mut self, n: usize) {
        self.transform_pos += n;
        debug_assert!(self.transform_pos <= self.write);
    }

    /// True once every byte of the block has been both written and consumed.
    /// A retired block carries no further use and goes back to the pool.
    pub fn is_retired(&self) -> bool {
        self.read == self.data.len() && self.write == self.data.len()
    }

    /// True once the read cursor has drained everything written so far.
    pub fn is_drained(&self) -> bool {
        self.read == self.write
    }

    /// Resets all cursors so the block can be reused from the pool.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.transform_pos = 0;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("capacity", &self.data.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("transform_pos", &self.transform_pos)
            .finish()
    }
}
