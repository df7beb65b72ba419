//! Receiver: listen, validate, assemble, and write the byte stream out.
//!
//! The read loop has exactly two wake-ups: the next datagram or the idle
//! timer, whichever fires first. There is nothing to send back — malformed
//! packets are dropped silently (but counted), loss beyond the parity budget
//! becomes an incomplete stream, and the idle timer is the only way to give
//! up on a sender that went quiet.

use std::io::Write;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::assembler::BlockAssembler;
use crate::fec::FecParams;
use crate::protocol::{self, PacketHeader, HEADER_BYTES, LENGTH_TRAILER_BYTES};
use crate::transport::DatagramSource;
use crate::{DiodeConfig, DiodeError, ReceiveOutcome};

/// Receives a single stream from a one-way transport.
#[derive(Debug)]
pub struct DiodeReceiver<T> {
    config: DiodeConfig,
    transport: T,
    assembler: BlockAssembler,
    recv_buf: Vec<u8>,
    malformed: u64,
}

impl<T: DatagramSource> DiodeReceiver<T> {
    pub fn new(config: DiodeConfig, transport: T) -> Result<Self, DiodeError> {
        config.validate()?;
        let params = FecParams::new(config.k, config.r, config.chunk_bytes)?;
        Ok(Self {
            assembler: BlockAssembler::new(params, config.window_blocks),
            // One byte of slack so an oversized datagram shows up as a
            // length mismatch instead of parsing as a truncated chunk.
            recv_buf: vec![0u8; HEADER_BYTES + config.chunk_bytes + LENGTH_TRAILER_BYTES + 1],
            config,
            transport,
            malformed: 0,
        })
    }

    /// Run until the stream completes or the idle timeout fires, writing
    /// reassembled bytes to `out` in order.
    pub async fn run<W: Write>(&mut self, out: &mut W) -> Result<ReceiveOutcome, DiodeError> {
        loop {
            if self.assembler.finished() {
                break;
            }

            let recv = tokio::time::timeout(
                self.config.idle_timeout,
                self.transport.recv_datagram(&mut self.recv_buf),
            );
            let n = match recv.await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(DiodeError::Io(err)),
                Err(_elapsed) => {
                    if self.assembler.terminal_seen() {
                        warn!("idle timeout with unresolved blocks before end of stream");
                    } else {
                        warn!(
                            timeout_ms = self.config.idle_timeout.as_millis() as u64,
                            "idle timeout without observing end of stream"
                        );
                    }
                    break;
                }
            };

            for chunk in self.process_datagram(n) {
                out.write_all(&chunk)?;
            }
        }

        out.flush()?;

        let stats = *self.assembler.stats();
        let outcome = if self.assembler.finished() && stats.blocks_lost == 0 {
            ReceiveOutcome::Complete
        } else {
            ReceiveOutcome::Incomplete
        };
        info!(
            chunks = stats.chunks_stored,
            duplicates = stats.duplicates,
            malformed = self.malformed,
            recovered = stats.chunks_recovered,
            blocks = stats.blocks_emitted,
            lost = stats.blocks_lost,
            ?outcome,
            "receive finished"
        );
        Ok(outcome)
    }

    /// Packets dropped because they failed header or session validation.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Best-effort close: force every in-flight block out of the window in
    /// order, writing the ones that can still be emitted, then flush.
    pub fn drain<W: Write>(&mut self, out: &mut W) -> Result<(), DiodeError> {
        for chunk in self.assembler.drain() {
            out.write_all(&chunk)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Parse and validate one datagram, feeding it to the assembler.
    fn process_datagram(&mut self, n: usize) -> Vec<Vec<u8>> {
        let Some(header) = PacketHeader::from_bytes(&self.recv_buf[..n]) else {
            self.malformed += 1;
            debug!(len = n, "dropping unparseable datagram");
            return Vec::new();
        };
        if !self.session_valid(&header, n) {
            self.malformed += 1;
            debug!(
                block = header.block_id,
                chunk = header.chunk_index,
                "dropping packet failing session checks"
            );
            return Vec::new();
        }
        let declared_len = if header.is_last_block() {
            match protocol::read_length_trailer(&self.recv_buf[..n]) {
                Some(len) if len as usize <= self.config.k * self.config.chunk_bytes => {
                    Some(len as usize)
                }
                _ => {
                    self.malformed += 1;
                    debug!(block = header.block_id, "dropping packet with bad length trailer");
                    return Vec::new();
                }
            }
        } else {
            None
        };
        let payload_end = HEADER_BYTES + header.payload_len as usize;
        let payload = &self.recv_buf[HEADER_BYTES..payload_end];
        self.assembler.accept(&header, payload, declared_len, Instant::now())
    }

    /// Session-level sanity: coding parameters must match ours, the datagram
    /// length must agree with the header, and chunk indices must be in range.
    fn session_valid(&self, header: &PacketHeader, n: usize) -> bool {
        let k = self.config.k;
        let r = self.config.r;
        let cb = self.config.chunk_bytes;
        let payload_len = header.payload_len as usize;

        if header.k as usize != k || header.r as usize != r {
            return false;
        }
        // Terminal-block packets carry the stream-length trailer.
        let overhead = if header.is_last_block() {
            HEADER_BYTES + LENGTH_TRAILER_BYTES
        } else {
            HEADER_BYTES
        };
        if n != overhead + payload_len || payload_len > cb {
            return false;
        }
        let idx = header.chunk_index as usize;
        if header.is_parity() {
            // Parity always carries a full, padded chunk.
            idx >= k && idx < k + r && payload_len == cb
        } else {
            // Short data payloads exist only in the terminal block.
            idx < k && (header.is_last_block() || payload_len == cb)
        }
    }
}
