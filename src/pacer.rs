//! Open-loop send pacing.
//!
//! With no back-channel the receiver cannot push back, so the sender must
//! hold itself to a configured throughput. The pacer tracks how many bytes
//! have been accounted since the first send and sleeps whenever the sender
//! runs ahead of the `bytes / rate` schedule. Pacing against the schedule
//! rather than sleeping a fixed interval per packet keeps the long-run rate
//! accurate even when individual sends stall.

use std::time::{Duration, Instant};

/// Paces transmission toward a target rate in bytes per second.
#[derive(Debug)]
pub struct Pacer {
    /// Target rate in bytes per second; 0 disables pacing.
    rate: u64,
    started: Option<Instant>,
    accounted: u64,
}

impl Pacer {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            started: None,
            accounted: 0,
        }
    }

    /// Account `bytes` and return how long to sleep to stay on schedule.
    fn backlog(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        let started = *self.started.get_or_insert(now);
        self.accounted += bytes as u64;
        let target = Duration::from_secs_f64(self.accounted as f64 / self.rate as f64);
        target.saturating_sub(now - started)
    }

    /// Account `bytes` just sent and wait out any schedule surplus.
    pub async fn pace(&mut self, bytes: usize) {
        let delay = self.backlog(bytes, Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
