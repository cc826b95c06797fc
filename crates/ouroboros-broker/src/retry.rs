//! Reconnect backoff hint
//!
//! The broker never sleeps or loops on its own; it only advances this
//! backoff when a connection attempt fails so the supervisor relaunching
//! `start_consuming` knows how long to wait.

use std::time::Duration;

/// Fibonacci backoff (1, 1, 2, 3, 5, 8 ... seconds), capped at `max_delay`
#[derive(Debug, Clone)]
pub struct Backoff {
    previous: u64,
    current: u64,
    max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            previous: 0,
            current: 1,
            max_delay,
        }
    }

    /// Return the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current).min(self.max_delay);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        delay
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = 1;
    }
}
