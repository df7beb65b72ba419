//! Receiver-side block assembly.
//!
//! Incoming packets are slotted into per-block buffers keyed by `block_id`.
//! Reordering costs nothing because storage is position-indexed; duplicates
//! are dropped when their slot is already occupied. A block becomes
//! reconstructable once it holds at least `k` chunks in any mix of data and
//! parity; missing data chunks are then recovered with
//! [`fec::reconstruct`](crate::fec::reconstruct).
//!
//! Data is emitted downstream strictly in `(block_id, chunk_index)` order. A
//! bounded window of in-flight blocks caps memory: when a packet arrives for
//! a block far ahead of the oldest unresolved one, the oldest is forced out —
//! emitted if reconstructable, otherwise declared lost and dropped whole so
//! the surviving stream stays aligned.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::fec::{self, FecParams};
use crate::protocol::PacketHeader;

/// Counters kept while a stream is being assembled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblerStats {
    /// Chunks accepted into a slot (duplicates excluded).
    pub chunks_stored: u64,
    /// Packets dropped because their slot was already filled, plus packets
    /// for blocks already retired.
    pub duplicates: u64,
    /// Packets ignored because they lie beyond the terminal block.
    pub stray: u64,
    /// Data chunks rebuilt by the decoder.
    pub chunks_recovered: u64,
    pub blocks_emitted: u64,
    pub blocks_lost: u64,
}

/// Buffered chunks of one in-flight block.
#[derive(Debug)]
struct PartialBlock {
    /// One slot per chunk index, data then parity.
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    last_block: bool,
    /// Tightest known bound on the block's true byte length. Terminal
    /// packets declare it outright via their length trailer; short data
    /// payloads corroborate it. Full blocks stay at `k * chunk`.
    data_len_bound: usize,
    first_arrival: Instant,
}

impl PartialBlock {
    fn new(total_slots: usize, full_len: usize, now: Instant) -> Self {
        Self {
            slots: vec![None; total_slots],
            received: 0,
            last_block: false,
            data_len_bound: full_len,
            first_arrival: now,
        }
    }

    /// Number of data chunks the block's bytes actually span.
    fn needed_chunks(&self, chunk_bytes: usize) -> usize {
        self.data_len_bound.div_ceil(chunk_bytes)
    }

    /// Whether the data chunks can be produced right now: either every slot
    /// that carries stream bytes is present, or enough chunks exist for the
    /// decoder.
    fn ready(&self, params: &FecParams) -> bool {
        if self.received >= params.k() {
            return true;
        }
        self.last_block
            && (0..self.needed_chunks(params.chunk_bytes())).all(|j| self.slots[j].is_some())
    }
}

/// Sliding-window reassembly of blocks into an ordered chunk stream.
#[derive(Debug)]
pub struct BlockAssembler {
    params: FecParams,
    window_blocks: usize,
    /// In-flight blocks; keys are always >= `next_emit`.
    blocks: BTreeMap<u32, PartialBlock>,
    /// Lowest block id not yet emitted or declared lost.
    next_emit: u32,
    /// Block id carrying `LAST_BLOCK`, once observed.
    terminal: Option<u32>,
    stats: AssemblerStats,
}

impl BlockAssembler {
    pub fn new(params: FecParams, window_blocks: usize) -> Self {
        Self {
            params,
            window_blocks,
            blocks: BTreeMap::new(),
            next_emit: 0,
            terminal: None,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// Whether the end-of-stream marker has been observed.
    pub fn terminal_seen(&self) -> bool {
        self.terminal.is_some()
    }

    /// Whether every block up to and including the terminal one is resolved.
    pub fn finished(&self) -> bool {
        matches!(self.terminal, Some(t) if self.next_emit > t)
    }

    /// Slot a validated packet and return any data chunks that became
    /// emittable, in stream order. Chunks are already truncated to their
    /// valid length. `declared_len` is the block length carried by every
    /// terminal-block packet's trailer; `None` for interior blocks.
    pub fn accept(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        declared_len: Option<usize>,
        now: Instant,
    ) -> Vec<Vec<u8>> {
        let id = header.block_id;
        let slot = header.chunk_index as usize;
        let chunk_bytes = self.params.chunk_bytes();

        if slot >= self.params.total_chunks() {
            return Vec::new();
        }
        if id < self.next_emit {
            // Retired block; redundant terminal rounds land here.
            self.stats.duplicates += 1;
            return Vec::new();
        }
        if let Some(t) = self.terminal {
            if id > t {
                self.stats.stray += 1;
                return Vec::new();
            }
        }

        let full_len = self.params.k() * chunk_bytes;
        let block = self
            .blocks
            .entry(id)
            .or_insert_with(|| PartialBlock::new(self.params.k() + self.params.r(), full_len, now));

        if block.slots[slot].is_some() {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        let mut chunk = payload.to_vec();
        chunk.resize(chunk_bytes, 0);
        block.slots[slot] = Some(chunk);
        block.received += 1;
        self.stats.chunks_stored += 1;

        if header.is_last_block() {
            block.last_block = true;
        }
        if let Some(len) = declared_len {
            block.data_len_bound = block.data_len_bound.min(len);
        }
        if !header.is_parity() && (header.payload_len as usize) < chunk_bytes {
            let bound = slot * chunk_bytes + header.payload_len as usize;
            block.data_len_bound = block.data_len_bound.min(bound);
        }

        if header.is_last_block() && self.terminal.is_none() {
            self.terminal = Some(id);
            debug!(block = id, "end of stream marker observed");
            // Anything beyond the terminal block is noise.
            let dropped = self.blocks.split_off(&(id + 1));
            self.stats.stray += dropped.len() as u64;
        }

        let mut out = Vec::new();

        // Window advance: force the oldest block out once the span from it to
        // the newest arrival reaches the window size.
        while id.saturating_sub(self.next_emit) >= self.window_blocks as u32 {
            self.resolve_head(&mut out);
        }

        // Emit every consecutively ready block.
        while let Some(block) = self.blocks.get(&self.next_emit) {
            if !block.ready(&self.params) {
                break;
            }
            if let Some(block) = self.blocks.remove(&self.next_emit) {
                let id = self.next_emit;
                self.emit_block(id, block, &mut out);
                self.next_emit += 1;
            }
        }

        out
    }

    /// Force every in-flight block out of the window, in order: blocks that
    /// can still be emitted are returned, the rest are declared lost. Used
    /// for a best-effort close on interruption.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !self.blocks.is_empty() {
            self.resolve_head(&mut out);
        }
        out
    }

    /// Retire the oldest unresolved block: emit it if possible, otherwise
    /// declare it lost.
    fn resolve_head(&mut self, out: &mut Vec<Vec<u8>>) {
        let id = self.next_emit;
        self.next_emit += 1;

        match self.blocks.remove(&id) {
            Some(block) if block.ready(&self.params) => {
                self.emit_block(id, block, out);
            }
            Some(block) => {
                warn!(
                    block = id,
                    chunks = block.received,
                    age_ms = block.first_arrival.elapsed().as_millis() as u64,
                    "evicting unrecoverable block; stream will be incomplete"
                );
                self.stats.blocks_lost += 1;
            }
            None => {
                warn!(block = id, "every packet of block lost; stream will be incomplete");
                self.stats.blocks_lost += 1;
            }
        }
    }

    /// Recover missing data chunks if needed, then push the block's valid
    /// bytes onto `out`.
    fn emit_block(&mut self, id: u32, mut block: PartialBlock, out: &mut Vec<Vec<u8>>) {
        let k = self.params.k();
        let chunk_bytes = self.params.chunk_bytes();
        let data_len = if block.last_block {
            block.data_len_bound
        } else {
            k * chunk_bytes
        };
        let needed = data_len.div_ceil(chunk_bytes);

        let have_all_needed = (0..needed).all(|j| block.slots[j].is_some());
        if !have_all_needed {
            let (data, parity) = block.slots.split_at_mut(k);
            let available: Vec<(usize, &[u8])> = parity
                .iter()
                .enumerate()
                .filter_map(|(p, s)| s.as_deref().map(|bytes| (p, bytes)))
                .collect();
            match fec::reconstruct(&self.params, data, &available) {
                Ok(recovered) => {
                    debug!(block = id, recovered, "block reconstructed");
                    self.stats.chunks_recovered += recovered as u64;
                }
                Err(err) => {
                    warn!(block = id, %err, "block unrecoverable; stream will be incomplete");
                    self.stats.blocks_lost += 1;
                    return;
                }
            }
        }

        for j in 0..needed {
            let take = (data_len - j * chunk_bytes).min(chunk_bytes);
            if let Some(mut chunk) = block.slots[j].take() {
                chunk.truncate(take);
                out.push(chunk);
            }
        }
        self.stats.blocks_emitted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::encode_parity;

    const CB: usize = 8;

    /// (header, payload, trailer length) as the receiver would hand them over.
    type TestPacket = (PacketHeader, Vec<u8>, Option<usize>);

    fn params(k: usize, r: usize) -> FecParams {
        FecParams::new(k, r, CB).unwrap()
    }

    /// Build the full packet family for one block of `data` bytes.
    fn packets(params: &FecParams, id: u32, data: &[u8], last: bool) -> Vec<TestPacket> {
        let k = params.k();
        let declared = last.then_some(data.len());
        let mut chunks: Vec<Vec<u8>> = data
            .chunks(CB)
            .map(|c| {
                let mut v = c.to_vec();
                v.resize(CB, 0);
                v
            })
            .collect();
        chunks.resize(k, vec![0u8; CB]);

        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let parity = encode_parity(params, &refs);

        let mut out = Vec::new();
        for (j, chunk) in chunks.iter().enumerate() {
            let payload_len = data.len().saturating_sub(j * CB).min(CB);
            out.push((
                PacketHeader::data(id, j as u8, payload_len as u16, last, k as u8, params.r() as u8),
                chunk[..payload_len].to_vec(),
                declared,
            ));
        }
        for (p, chunk) in parity.iter().enumerate() {
            out.push((
                PacketHeader::parity(id, (k + p) as u8, CB as u16, last, k as u8, params.r() as u8),
                chunk.clone(),
                declared,
            ));
        }
        out
    }

    fn feed(asm: &mut BlockAssembler, pkts: &[TestPacket]) -> Vec<u8> {
        let now = Instant::now();
        let mut out = Vec::new();
        for (header, payload, declared) in pkts {
            for chunk in asm.accept(header, payload, *declared, now) {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }

    #[test]
    fn in_order_stream_emits_immediately() {
        let params = params(2, 1);
        let mut asm = BlockAssembler::new(params, 8);

        let data: Vec<u8> = (0u8..16).collect();
        let out = feed(&mut asm, &packets(&params, 0, &data, false));
        assert_eq!(out, data);

        let out = feed(&mut asm, &packets(&params, 1, &[], true));
        assert!(out.is_empty());
        assert!(asm.finished());
        assert_eq!(asm.stats().blocks_lost, 0);
    }

    #[test]
    fn duplicates_are_dropped() {
        let params = params(2, 1);
        let mut asm = BlockAssembler::new(params, 8);

        let data: Vec<u8> = (0u8..16).collect();
        let pkts = packets(&params, 0, &data, false);
        let mut doubled = Vec::new();
        for p in &pkts {
            doubled.push(p.clone());
            doubled.push(p.clone());
        }

        let out = feed(&mut asm, &doubled);
        assert_eq!(out, data);
        // Everything beyond the two chunks that completed the block is a
        // duplicate, including the parity that arrived after retirement.
        assert_eq!(asm.stats().duplicates as usize, doubled.len() - 2);
    }

    #[test]
    fn out_of_order_blocks_wait_for_the_gap() {
        let params = params(2, 0);
        let mut asm = BlockAssembler::new(params, 8);

        let block0: Vec<u8> = vec![0xAA; 16];
        let block1: Vec<u8> = vec![0xBB; 16];

        let out = feed(&mut asm, &packets(&params, 1, &block1, false));
        assert!(out.is_empty(), "block 1 must wait for block 0");

        let out = feed(&mut asm, &packets(&params, 0, &block0, false));
        let mut expected = block0.clone();
        expected.extend_from_slice(&block1);
        assert_eq!(out, expected);
    }

    #[test]
    fn parity_substitutes_for_lost_data() {
        let params = params(4, 2);
        let mut asm = BlockAssembler::new(params, 8);

        let data: Vec<u8> = (0u8..32).collect();
        let mut pkts = packets(&params, 0, &data, false);
        // Lose two data chunks; both parities survive.
        pkts.remove(2);
        pkts.remove(0);

        let out = feed(&mut asm, &pkts);
        assert_eq!(out, data);
        assert_eq!(asm.stats().chunks_recovered, 2);
    }

    #[test]
    fn far_future_block_evicts_the_head() {
        let params = params(2, 0);
        let mut asm = BlockAssembler::new(params, 4);

        // Block 0 stays one chunk short of reconstructable.
        let data0: Vec<u8> = vec![0x11; 16];
        let mut partial = packets(&params, 0, &data0, false);
        partial.truncate(1);
        assert!(feed(&mut asm, &partial).is_empty());

        for id in 1..4 {
            let data: Vec<u8> = vec![id as u8; 16];
            assert!(feed(&mut asm, &packets(&params, id, &data, false)).is_empty());
        }

        // Block 4 pushes the span past the window: block 0 is declared lost
        // and blocks 1..=4 drain in order.
        let data4: Vec<u8> = vec![0x44; 16];
        let out = feed(&mut asm, &packets(&params, 4, &data4, false));
        let mut expected = Vec::new();
        for id in 1..=4u8 {
            expected.extend(std::iter::repeat(if id == 4 { 0x44 } else { id }).take(16));
        }
        assert_eq!(out, expected);
        assert_eq!(asm.stats().blocks_lost, 1);
        assert!(!asm.finished());
    }

    #[test]
    fn wholly_missing_block_is_counted_lost() {
        let params = params(2, 0);
        let mut asm = BlockAssembler::new(params, 2);

        // Blocks 2 and 3 arrive; block 0 and 1 never do.
        assert!(feed(&mut asm, &packets(&params, 2, &[0x22; 16], false)).is_empty());
        let out = feed(&mut asm, &packets(&params, 3, &[0x33; 16], false));

        let mut expected = vec![0x22u8; 16];
        expected.extend_from_slice(&[0x33; 16]);
        assert_eq!(out, expected);
        assert_eq!(asm.stats().blocks_lost, 2);
    }

    #[test]
    fn terminal_block_truncates_to_true_length() {
        let params = params(4, 2);
        let mut asm = BlockAssembler::new(params, 8);

        let out = feed(&mut asm, &packets(&params, 0, b"hello", true));
        assert_eq!(out, b"hello");
        assert!(asm.finished());
    }

    #[test]
    fn terminal_short_chunk_recovered_via_parity() {
        let params = params(4, 2);
        let mut asm = BlockAssembler::new(params, 8);

        // Lose the short data chunk (index 0); pads and parity remain, so the
        // block reaches k chunks. Parity rebuilds the chunk's bytes and the
        // length trailer on the surviving packets pins the remainder, so the
        // output is byte-for-byte exact.
        let mut pkts = packets(&params, 0, b"hello", true);
        pkts.remove(0);

        let out = feed(&mut asm, &pkts);
        assert_eq!(out, b"hello");
        assert!(asm.finished());
        assert_eq!(asm.stats().chunks_recovered, 1);
    }

    #[test]
    fn terminal_length_survives_any_short_chunk_and_pad_loss() {
        // k = 4, r = 3: lose the short chunk and every pad, keep two full
        // data chunks and all parity. No surviving packet has a short
        // payload, yet the trailer still gives the exact length.
        let params = params(4, 3);
        let mut asm = BlockAssembler::new(params, 8);

        let data: Vec<u8> = (0u8..21).collect(); // 2 full chunks + 5 bytes
        let mut pkts = packets(&params, 0, &data, true);
        pkts.remove(3); // pad
        pkts.remove(2); // short chunk

        let out = feed(&mut asm, &pkts);
        assert_eq!(out, data);
        assert!(asm.finished());
        assert_eq!(asm.stats().chunks_recovered, 2);
    }

    #[test]
    fn empty_terminal_marker_completes_the_stream() {
        let params = params(4, 2);
        let mut asm = BlockAssembler::new(params, 8);

        let header = PacketHeader::data(0, 0, 0, true, 4, 2);
        let out = asm.accept(&header, &[], Some(0), Instant::now());
        assert!(out.is_empty());
        assert!(asm.finished());
        assert_eq!(asm.stats().blocks_emitted, 1);
    }

    #[test]
    fn drain_forces_the_window_out() {
        let params = params(2, 0);
        let mut asm = BlockAssembler::new(params, 8);

        // Block 0 is stuck one chunk short; block 1 is complete but gated
        // behind it in emission order.
        let mut partial = packets(&params, 0, &[0x11; 16], false);
        partial.truncate(1);
        assert!(feed(&mut asm, &partial).is_empty());
        assert!(feed(&mut asm, &packets(&params, 1, &[0x22; 16], false)).is_empty());

        let drained: Vec<u8> = asm.drain().into_iter().flatten().collect();
        assert_eq!(drained, vec![0x22; 16]);
        assert_eq!(asm.stats().blocks_lost, 1);
        assert_eq!(asm.stats().blocks_emitted, 1);
    }

    #[test]
    fn insufficient_chunks_leave_block_pending() {
        let params = params(4, 2);
        let mut asm = BlockAssembler::new(params, 8);

        let data: Vec<u8> = (0u8..32).collect();
        let mut pkts = packets(&params, 0, &data, false);
        pkts.truncate(3); // 3 of 6 chunks: below k

        assert!(feed(&mut asm, &pkts).is_empty());
        assert!(!asm.finished());
        assert_eq!(asm.stats().blocks_emitted, 0);
    }
}
