//! Retry schedules for operations that hit transient remote contention.

use std::time::Duration;

/// A non-decreasing list of delays with a hard attempt limit. Attempts past
/// the end of the list reuse the last (cap) delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
    max_attempts: u32,
}

impl BackoffSchedule {
    /// Build a schedule from delays in seconds. Delays are clamped so the
    /// schedule never decreases.
    pub fn from_secs(delays: &[u64], max_attempts: u32) -> Self {
        let mut floor = 0;
        let delays = delays
            .iter()
            .map(|&secs| {
                floor = floor.max(secs);
                Duration::from_secs(floor)
            })
            .collect();
        Self {
            delays,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Disk resize: 10, 20, 40, 60, 60 seconds over five attempts.
    pub fn disk_resize() -> Self {
        Self::from_secs(&[10, 20, 40, 60, 60], 5)
    }

    /// Guest-init update: 5 ... 60 seconds, capped at 60, over ten attempts.
    pub fn guest_init() -> Self {
        Self::from_secs(&[5, 10, 15, 20, 30, 40, 50, 60], 10)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    /// Sum of the delays slept across the first `failures` failed attempts.
    pub fn total_delay(&self, failures: u32) -> Duration {
        (1..=failures).map(|attempt| self.delay_after(attempt)).sum()
    }
}
