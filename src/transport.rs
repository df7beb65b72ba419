//! Datagram transport abstraction.
//!
//! The sender and receiver are generic over a one-way datagram transport so
//! the protocol can run over a real UDP socket or, in tests, over in-memory
//! channels with injected loss. The traits use explicit boxed futures to stay
//! object-safe without an `async_trait` dependency.
//!
//! On a diode each peer only ever uses one direction: the sender needs a
//! [`DatagramSink`], the receiver a [`DatagramSource`].

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::sync::mpsc;

/// Sends whole datagrams.
pub trait DatagramSink {
    /// Send one datagram. Returns the number of bytes sent.
    fn send_datagram<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;
}

/// Receives whole datagrams.
pub trait DatagramSource {
    /// Receive one datagram into `buf`. Returns the number of bytes received;
    /// a datagram larger than `buf` is truncated.
    fn recv_datagram<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;
}

/// Connected UDP socket: `connect()` must have been called for sending.
impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move { self.send(data).await })
    }
}

impl DatagramSource for tokio::net::UdpSocket {
    fn recv_datagram<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            // recv_from rather than recv: the receiver does not connect,
            // since the sender's source port is not known in advance.
            let (n, _addr) = self.recv_from(buf).await?;
            Ok(n)
        })
    }
}

// =============================================================================
// In-memory transport (for tests)
// =============================================================================

/// In-memory datagram channel.
///
/// [`MemoryChannel::pair`] returns two connected endpoints; datagrams sent on
/// one are received on the other. Receiving returns `BrokenPipe` once the
/// peer is dropped and the queue is drained.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryChannel {
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        (Self { tx: tx1, rx: rx2 }, Self { tx: tx2, rx: rx1 })
    }
}

impl DatagramSink for MemoryChannel {
    fn send_datagram<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            self.tx
                .send(data.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
            Ok(data.len())
        })
    }
}

impl DatagramSource for MemoryChannel {
    fn recv_datagram<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let data = self
                .rx
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        })
    }
}

// =============================================================================
// Lossy transport (for tests)
// =============================================================================

/// Wraps a transport and drops datagrams deterministically.
///
/// Loss is decided from a per-direction packet counter, so a given
/// configuration always drops the same packets and tests stay reproducible.
#[derive(Debug)]
pub struct LossyChannel<T> {
    inner: T,
    /// Drop every Nth packet (0 = no pattern loss). Counted from packet 0.
    drop_every_n: u64,
    /// Pseudo-random loss probability in percent (0-100).
    random_loss_percent: u8,
    sent: u64,
    received: u64,
}

impl<T> LossyChannel<T> {
    /// Drop every `drop_every_n`-th packet (the 0th, Nth, 2Nth, ...).
    pub fn with_pattern(inner: T, drop_every_n: u64) -> Self {
        Self {
            inner,
            drop_every_n,
            random_loss_percent: 0,
            sent: 0,
            received: 0,
        }
    }

    /// Drop roughly `loss_percent`% of packets, hashed from the counter.
    pub fn with_random_loss(inner: T, loss_percent: u8) -> Self {
        Self {
            inner,
            drop_every_n: 0,
            random_loss_percent: loss_percent.min(100),
            sent: 0,
            received: 0,
        }
    }

    fn should_drop(&self, counter: u64) -> bool {
        if self.drop_every_n > 0 && counter % self.drop_every_n == 0 {
            return true;
        }
        if self.random_loss_percent > 0 {
            // Multiplicative hash by the golden-ratio constant; the top bits
            // are well mixed.
            let hash = counter.wrapping_mul(0x9E3779B97F4A7C15);
            let roll = ((hash >> 56) as u8) % 100;
            if roll < self.random_loss_percent {
                return true;
            }
        }
        false
    }
}

impl<T: DatagramSink + Send> DatagramSink for LossyChannel<T> {
    fn send_datagram<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let counter = self.sent;
            self.sent += 1;
            if self.should_drop(counter) {
                // The network ate it; the sender cannot tell.
                return Ok(data.len());
            }
            self.inner.send_datagram(data).await
        })
    }
}

impl<T: DatagramSource + Send> DatagramSource for LossyChannel<T> {
    fn recv_datagram<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let n = self.inner.recv_datagram(buf).await?;
                let counter = self.received;
                self.received += 1;
                if !self.should_drop(counter) {
                    return Ok(n);
                }
            }
        })
    }
}
