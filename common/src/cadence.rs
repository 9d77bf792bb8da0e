use crate::config::MeterConfig;

/// True once `now` has reached `due`, treating the counter as circular so a
/// wrapped clock neither skips nor repeats a deadline.
pub fn deadline_reached(now_ms: u64, due_ms: u64) -> bool {
    now_ms.wrapping_sub(due_ms) <= u64::MAX / 2
}

/// A fixed recurring interval with an explicit next deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    interval_ms: u64,
    next_due_ms: u64,
}

impl Cadence {
    /// First deadline is one full interval after `now_ms`.
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due_ms: now_ms.wrapping_add(interval_ms),
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    /// Fires at most once per call. The next deadline is measured from
    /// `now_ms`, so a long stall yields one late firing rather than a burst.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if !deadline_reached(now_ms, self.next_due_ms) {
            return false;
        }
        self.next_due_ms = now_ms.wrapping_add(self.interval_ms);
        true
    }
}

/// The three independent cadences driven by the control loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncClock {
    pub display: Cadence,
    pub telemetry: Cadence,
    pub relay_poll: Cadence,
}

impl SyncClock {
    pub fn new(config: &MeterConfig, boot_ms: u64) -> Self {
        Self {
            display: Cadence::new(config.display_refresh_ms, boot_ms),
            telemetry: Cadence::new(config.telemetry_interval_ms, boot_ms),
            relay_poll: Cadence::new(config.relay_poll_interval_ms, boot_ms),
        }
    }
}
