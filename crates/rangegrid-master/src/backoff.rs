//! Bounded exponential backoff for reassignment retries.

use std::time::Duration;

/// Doubling delay between retries of one reassignment, capped at a maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            max: max.max(base),
            current: base,
        }
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}
