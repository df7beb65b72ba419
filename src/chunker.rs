//! Partition an input octet stream into fixed-size chunks grouped in blocks.
//!
//! A block holds `k` data chunks of `chunk_bytes` each. Blocks are produced
//! strictly in order as input accumulates; whatever is left when the input
//! ends becomes the terminal block, which may hold fewer than `k` chunks (its
//! unused slots are zero-padded for coding) or no chunks at all for an empty
//! stream.

/// One block of data chunks ready for coding and emission.
#[derive(Debug, Clone)]
pub struct Block {
    /// Monotonically increasing, 0-based.
    pub id: u32,
    /// Whether this is the stream's final block.
    pub last: bool,
    /// Chunks actually holding stream bytes, each zero-padded to
    /// `chunk_bytes`. Empty only for the terminal block of an empty stream.
    pub chunks: Vec<Vec<u8>>,
    /// True number of stream bytes in this block.
    pub data_len: usize,
}

impl Block {
    /// Valid payload bytes of data slot `index`: full for interior chunks,
    /// the remainder for the last real chunk, zero for pad slots.
    pub fn payload_len_of(&self, index: usize, chunk_bytes: usize) -> usize {
        self.data_len
            .saturating_sub(index * chunk_bytes)
            .min(chunk_bytes)
    }
}

/// Accumulates input bytes and yields blocks of `k` chunks.
#[derive(Debug)]
pub struct BlockBuilder {
    chunk_bytes: usize,
    k: usize,
    next_id: u32,
    pending: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(chunk_bytes: usize, k: usize) -> Self {
        Self {
            chunk_bytes,
            k,
            next_id: 0,
            pending: Vec::with_capacity(chunk_bytes * k),
        }
    }

    /// Bytes of one full block.
    #[inline]
    fn block_bytes(&self) -> usize {
        self.chunk_bytes * self.k
    }

    /// Append input bytes, returning every block completed by them.
    ///
    /// Completed blocks are always full and never marked terminal; the
    /// terminal block comes from [`finish`](Self::finish).
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Block> {
        let cap = self.block_bytes();
        let mut blocks = Vec::new();

        while self.pending.len() + data.len() >= cap {
            let take = cap - self.pending.len();
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            let bytes = std::mem::replace(&mut self.pending, Vec::with_capacity(cap));
            blocks.push(self.make_block(bytes, false));
        }
        self.pending.extend_from_slice(data);
        blocks
    }

    /// Finalize the stream: the remaining bytes become the terminal block.
    ///
    /// An empty stream (or one ending exactly on a block boundary) still
    /// yields an empty terminal block so the receiver observes a definite
    /// end of stream.
    pub fn finish(&mut self) -> Block {
        let bytes = std::mem::take(&mut self.pending);
        self.make_block(bytes, true)
    }

    fn make_block(&mut self, bytes: Vec<u8>, last: bool) -> Block {
        let data_len = bytes.len();
        let chunks = bytes
            .chunks(self.chunk_bytes)
            .map(|c| {
                let mut chunk = c.to_vec();
                chunk.resize(self.chunk_bytes, 0);
                chunk
            })
            .collect();
        let id = self.next_id;
        self.next_id += 1;
        Block {
            id,
            last,
            chunks,
            data_len,
        }
    }
}
