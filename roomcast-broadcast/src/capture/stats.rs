//! Rolling send statistics for an outgoing broadcast

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Byte counters plus a bitrate recomputed once per window.
///
/// Purely observational; no control decision reads it.
#[derive(Debug, Clone)]
pub struct StatsWindow {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub current_bitrate_kbps: u32,
    pub window_start: Instant,
    window_bytes: u64,
}

impl StatsWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_sent: 0,
            chunks_sent: 0,
            current_bitrate_kbps: 0,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.bytes_sent += bytes;
        self.window_bytes += bytes;
        self.chunks_sent += 1;
    }

    /// Close the current window at `now` and start a new one
    pub fn roll(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.window_start).as_millis() as u64;
        if elapsed_ms == 0 {
            return;
        }
        // bits per millisecond == kilobits per second
        self.current_bitrate_kbps = (self.window_bytes * 8 / elapsed_ms).min(u64::from(u32::MAX)) as u32;
        self.window_bytes = 0;
        self.window_start = now;
    }

    #[must_use]
    pub const fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent,
            chunks_sent: self.chunks_sent,
            current_bitrate_kbps: self.current_bitrate_kbps,
        }
    }
}

impl Default for StatsWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub current_bitrate_kbps: u32,
}

pub type SharedStats = Arc<Mutex<StatsWindow>>;
