//! Stall and stagnation detection
//!
//! Counts consecutive "waiting" events and progress ticks whose position did
//! not move. Either counter crossing its threshold escalates into the fatal
//! error path. Forward progress and buffer appends reset both counters.

use serde::Serialize;
use std::fmt;

/// Position deltas below this many seconds count as no movement
pub const STAGNATION_EPSILON_SECS: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCounters {
    pub buffer_stalls: u32,
    pub stagnant_position_ticks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    BufferStalls(u32),
    Stagnation(u32),
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferStalls(n) => write!(f, "{n} consecutive buffer stalls"),
            Self::Stagnation(n) => write!(f, "position stuck for {n} progress ticks"),
        }
    }
}

/// Result of one progress tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub advanced: bool,
    pub escalation: Option<StallReason>,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    stall_threshold: u32,
    stagnation_threshold: u32,
    counters: HealthCounters,
    last_position: f64,
}

impl HealthMonitor {
    #[must_use]
    pub const fn new(stall_threshold: u32, stagnation_threshold: u32) -> Self {
        Self {
            stall_threshold,
            stagnation_threshold,
            counters: HealthCounters {
                buffer_stalls: 0,
                stagnant_position_ticks: 0,
            },
            last_position: 0.0,
        }
    }

    #[must_use]
    pub const fn counters(&self) -> HealthCounters {
        self.counters
    }

    pub fn reset(&mut self) {
        self.counters = HealthCounters::default();
        self.last_position = 0.0;
    }

    pub fn on_buffer_appended(&mut self) {
        self.counters = HealthCounters::default();
    }

    /// Record a "waiting" event
    pub fn on_waiting(&mut self) -> Option<StallReason> {
        self.counters.buffer_stalls += 1;
        if self.counters.buffer_stalls > self.stall_threshold {
            let reason = StallReason::BufferStalls(self.counters.buffer_stalls);
            self.counters.buffer_stalls = 0;
            return Some(reason);
        }
        None
    }

    /// Record a progress tick at `position` seconds
    pub fn on_time_update(&mut self, position: f64, paused: bool) -> Tick {
        let moved = (position - self.last_position).abs() >= STAGNATION_EPSILON_SECS;
        self.last_position = position;

        if paused {
            self.counters.stagnant_position_ticks = 0;
            return Tick {
                advanced: false,
                escalation: None,
            };
        }
        if moved {
            self.counters = HealthCounters::default();
            return Tick {
                advanced: true,
                escalation: None,
            };
        }

        self.counters.stagnant_position_ticks += 1;
        let escalation = (self.counters.stagnant_position_ticks > self.stagnation_threshold).then(|| {
            let reason = StallReason::Stagnation(self.counters.stagnant_position_ticks);
            self.counters.stagnant_position_ticks = 0;
            reason
        });
        Tick {
            advanced: false,
            escalation,
        }
    }
}
