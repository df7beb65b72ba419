//! Sender: chunk, encode, and emit blocks over a one-way transport.
//!
//! The sender is stateless with respect to the receiver — it streams blocks
//! through once and never revisits them. All reliability is front-loaded:
//! parity chunks per block, optional repeat rounds per block, and extra
//! replication of the terminal block so at least one `LAST_BLOCK` copy is
//! likely to arrive.

use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::chunker::{Block, BlockBuilder};
use crate::fec::{self, FecParams};
use crate::pacer::Pacer;
use crate::protocol::{self, PacketHeader, HEADER_BYTES, LENGTH_TRAILER_BYTES};
use crate::transport::DatagramSink;
use crate::{DiodeConfig, DiodeError};

/// Transient send failures are retried this many times with doubling backoff
/// before they become fatal.
const SEND_RETRIES: u32 = 5;

/// Totals reported when a transfer completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SenderStats {
    pub blocks: u64,
    pub packets: u64,
    /// Stream bytes consumed (excluding headers, parity and repeats).
    pub data_bytes: u64,
}

/// Streams an octet sequence through a datagram transport.
#[derive(Debug)]
pub struct DiodeSender<T> {
    config: DiodeConfig,
    params: FecParams,
    transport: T,
    pacer: Pacer,
    builder: BlockBuilder,
    send_buf: Vec<u8>,
    stats: SenderStats,
}

impl<T: DatagramSink> DiodeSender<T> {
    pub fn new(config: DiodeConfig, transport: T) -> Result<Self, DiodeError> {
        config.validate()?;
        let params = FecParams::new(config.k, config.r, config.chunk_bytes)?;
        Ok(Self {
            pacer: Pacer::new(config.rate),
            builder: BlockBuilder::new(config.chunk_bytes, config.k),
            send_buf: Vec::with_capacity(HEADER_BYTES + config.chunk_bytes + LENGTH_TRAILER_BYTES),
            config,
            params,
            transport,
            stats: SenderStats::default(),
        })
    }

    /// Feed input bytes; every block they complete is emitted immediately.
    pub async fn push(&mut self, data: &[u8]) -> io::Result<()> {
        self.stats.data_bytes += data.len() as u64;
        for block in self.builder.push(data) {
            self.send_block(&block).await?;
        }
        Ok(())
    }

    /// Emit the terminal block and return the transfer totals.
    ///
    /// Must be called exactly once, after the last [`push`](Self::push).
    pub async fn finish(&mut self) -> io::Result<SenderStats> {
        let block = self.builder.finish();
        self.send_block(&block).await?;
        Ok(self.stats)
    }

    /// Serialize and transmit one block: data chunks in index order, then
    /// parity, repeated for the configured number of rounds. Terminal-block
    /// packets all carry the block's byte length as a trailer so the true
    /// stream end survives the loss of the one short data chunk.
    async fn send_block(&mut self, block: &Block) -> io::Result<()> {
        let k = self.config.k;
        let cb = self.config.chunk_bytes;
        let trailer = block.last.then_some(block.data_len as u32);

        // An empty stream still announces its end: a single payload-free
        // LAST_BLOCK packet, replicated, with no parity.
        if block.chunks.is_empty() {
            let header = PacketHeader::data(block.id, 0, 0, true, k as u8, self.config.r as u8);
            for _ in 0..self.config.redundant_final.max(self.config.repeat) {
                self.send_packet(header, &[], trailer).await?;
            }
            self.stats.blocks += 1;
            debug!(block = block.id, "sent empty terminal block");
            return Ok(());
        }

        // Parity covers the zero-padded K chunks; pad slots of a partial
        // terminal block contribute zeros.
        let pad = vec![0u8; cb];
        let mut data_refs: Vec<&[u8]> = block.chunks.iter().map(|c| c.as_slice()).collect();
        data_refs.resize(k, pad.as_slice());
        let parity = fec::encode_parity(&self.params, &data_refs);

        let rounds = if block.last {
            self.config.repeat.max(self.config.redundant_final)
        } else {
            self.config.repeat
        };

        for round in 0..rounds {
            trace!(block = block.id, round, "emitting block");
            for (j, chunk) in data_refs.iter().enumerate() {
                let payload_len = block.payload_len_of(j, cb);
                let header = PacketHeader::data(
                    block.id,
                    j as u8,
                    payload_len as u16,
                    block.last,
                    k as u8,
                    self.config.r as u8,
                );
                self.send_packet(header, &chunk[..payload_len], trailer).await?;
            }
            for (p, chunk) in parity.iter().enumerate() {
                let header = PacketHeader::parity(
                    block.id,
                    (k + p) as u8,
                    cb as u16,
                    block.last,
                    k as u8,
                    self.config.r as u8,
                );
                self.send_packet(header, chunk, trailer).await?;
            }
        }

        self.stats.blocks += 1;
        debug!(
            block = block.id,
            bytes = block.data_len,
            last = block.last,
            rounds,
            "block sent"
        );
        Ok(())
    }

    /// Build the datagram, send it (retrying transient failures), then pace.
    async fn send_packet(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
        block_len: Option<u32>,
    ) -> io::Result<()> {
        self.send_buf.clear();
        self.send_buf.extend_from_slice(&header.to_bytes());
        self.send_buf.extend_from_slice(payload);
        if let Some(len) = block_len {
            protocol::push_length_trailer(&mut self.send_buf, len);
        }

        let mut backoff = Duration::from_millis(1);
        let mut attempt = 0;
        loop {
            match self.transport.send_datagram(&self.send_buf).await {
                Ok(_) => break,
                Err(err) if attempt < SEND_RETRIES && is_transient(&err) => {
                    debug!(%err, attempt, "socket busy, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }

        self.stats.packets += 1;
        self.pacer.pace(self.send_buf.len()).await;
        Ok(())
    }
}

/// Send-buffer pressure clears on its own; anything else is surfaced to the
/// caller. ENOBUFS has no `ErrorKind` of its own (it decodes to `Other`), so
/// it is matched by errno.
fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::ENOBUFS) {
        return true;
    }
    false
}
