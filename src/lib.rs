//! One-way reliable byte-stream transfer over UDP, built for data diodes.
//!
//! A data diode physically removes the return channel, so nothing here ever
//! acknowledges, retransmits, or negotiates. Reliability is open-loop:
//!
//! - the input stream is cut into fixed-size chunks grouped in blocks of `k`;
//! - each block gains `r` Cauchy Reed-Solomon parity chunks, so any `k` of
//!   the `k + r` packets rebuild it;
//! - emission is paced to a configured rate because the receiver cannot push
//!   back;
//! - the terminal block is replicated so the end-of-stream marker survives;
//! - the receiver dedups, reorders through block-indexed storage, decodes,
//!   and emits bytes strictly in order.
//!
//! # Example
//!
//! ```rust,no_run
//! use diode::{DiodeConfig, DiodeSender, DiodeReceiver};
//!
//! # async fn run() -> anyhow::Result<()> {
//! // Sender
//! let socket = tokio::net::UdpSocket::bind("192.0.2.1:0").await?;
//! socket.connect("192.0.2.2:1234").await?;
//! let mut sender = DiodeSender::new(DiodeConfig::default(), socket)?;
//! sender.push(b"some bytes").await?;
//! sender.finish().await?;
//!
//! // Receiver
//! let socket = tokio::net::UdpSocket::bind("192.0.2.2:1234").await?;
//! let mut receiver = DiodeReceiver::new(DiodeConfig::default(), socket)?;
//! let mut out = Vec::new();
//! let _outcome = receiver.run(&mut out).await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::time::Duration;

pub mod assembler;
pub mod chunker;
pub mod fec;
pub mod pacer;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod transport;

#[cfg(test)]
mod tests;

pub use fec::FecError;
pub use receiver::DiodeReceiver;
pub use sender::{DiodeSender, SenderStats};

/// Largest chunk that still fits a UDP datagram next to the 12-byte header.
pub const MAX_CHUNK_BYTES: usize = 65507 - protocol::HEADER_BYTES;

/// Session parameters, fixed for the lifetime of a transfer and identical on
/// both peers (the wire carries `k` and `r` only as a sanity check).
#[derive(Debug, Clone)]
pub struct DiodeConfig {
    /// Bytes per chunk; one chunk per UDP datagram.
    pub chunk_bytes: usize,
    /// Data chunks per block.
    pub k: usize,
    /// Parity chunks per block. `r / (k + r)` must exceed the worst expected
    /// loss rate with margin.
    pub r: usize,
    /// Sender pacing target in bytes per second; 0 disables pacing.
    pub rate: u64,
    /// Rounds each block's packet family is emitted.
    pub repeat: u32,
    /// Rounds for the terminal block (taken as a floor over `repeat`), so at
    /// least one `LAST_BLOCK` copy is likely to arrive.
    pub redundant_final: u32,
    /// Receiver: maximum in-flight blocks before the oldest is forced out.
    pub window_blocks: usize,
    /// Receiver: give up after this long without any packet.
    pub idle_timeout: Duration,
}

impl Default for DiodeConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 1024,
            k: 64,
            r: 32,
            rate: 125_000_000,
            repeat: 1,
            redundant_final: 3,
            window_blocks: 64,
            idle_timeout: Duration::from_secs(2),
        }
    }
}

impl DiodeConfig {
    /// Check parameter ranges; called before any socket is opened.
    pub fn validate(&self) -> Result<(), DiodeError> {
        if self.chunk_bytes == 0 || self.chunk_bytes > MAX_CHUNK_BYTES {
            return Err(DiodeError::Config(format!(
                "chunk_bytes must be in 1..={}",
                MAX_CHUNK_BYTES
            )));
        }
        if self.k == 0 || self.k > 255 {
            // k must also fit the one-byte header field.
            return Err(DiodeError::Config("k must be in 1..=255".into()));
        }
        if self.k + self.r > fec::MAX_TOTAL_CHUNKS {
            return Err(DiodeError::Config(format!(
                "k + r must not exceed {}",
                fec::MAX_TOTAL_CHUNKS
            )));
        }
        if self.repeat == 0 || self.redundant_final == 0 {
            return Err(DiodeError::Config(
                "repeat and redundant_final must be at least 1".into(),
            ));
        }
        if self.window_blocks == 0 {
            return Err(DiodeError::Config("window must be at least 1 block".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(DiodeError::Config("idle timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// How a receive run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Terminal block observed and every block up to it emitted.
    Complete,
    /// The idle timeout fired before the terminal block was resolved, or
    /// blocks were lost beyond the parity budget.
    Incomplete,
}

/// Top-level error type.
#[derive(Debug)]
pub enum DiodeError {
    /// Parameters out of range; reported before any I/O happens.
    Config(String),
    /// Coding failure.
    Fec(FecError),
    /// Socket or output failure that is not transient.
    Io(io::Error),
}

impl std::fmt::Display for DiodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiodeError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            DiodeError::Fec(err) => write!(f, "coding error: {}", err),
            DiodeError::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl std::error::Error for DiodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiodeError::Config(_) => None,
            DiodeError::Fec(err) => Some(err),
            DiodeError::Io(err) => Some(err),
        }
    }
}

impl From<FecError> for DiodeError {
    fn from(err: FecError) -> Self {
        DiodeError::Fec(err)
    }
}

impl From<io::Error> for DiodeError {
    fn from(err: io::Error) -> Self {
        DiodeError::Io(err)
    }
}
