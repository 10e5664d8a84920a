//! Signaling reconnect backoff

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnect delay.
///
/// Starts at the initial delay, doubles after every failed attempt up to the
/// cap, and snaps back to the initial delay once a connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff from explicit bounds
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Create a backoff from configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
        )
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay the next attempt would use, without advancing
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// A connection succeeded
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
