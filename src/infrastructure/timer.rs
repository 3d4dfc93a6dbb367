use crate::types::CREDENTIAL_RETRY_INTERVALS;
use std::time::Duration;

/// Stepped backoff: walks a list of intervals, then repeats the last one.
#[derive(Debug, Clone)]
pub struct Timer {
    attempts: u32,
    intervals: Vec<u64>,
}

impl Timer {
    pub fn new(intervals: Vec<u64>) -> Self {
        Self {
            attempts: 0,
            intervals,
        }
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .intervals
            .get(self.attempts as usize)
            .or(self.intervals.last())
            .copied()
            .unwrap_or(10_000);

        self.attempts += 1;
        Duration::from_millis(delay)
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(CREDENTIAL_RETRY_INTERVALS.to_vec())
    }
}
