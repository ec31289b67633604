//! Reconnect state machine and retry backoff for the long-poll loop.

use std::time::Duration;

use crate::types::TimingConfig;

/// Connection state of the long-poll loop.
///
/// ```text
/// Disconnected ──attempt──► Retrying ──success──► Connected
///      ▲                        │                     │
///      └────────failure─────────┴──────failure────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connected,
    Disconnected,
    Retrying,
}

/// Capped exponential backoff with no jitter, so consecutive delays never
/// decrease.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before the retry that follows the `failures`-th consecutive
    /// failure: min, 2·min, 4·min, … capped at max.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30);
        self.min.saturating_mul(1u32 << exp).min(self.max)
    }

    #[cfg(test)]
    pub fn min(&self) -> Duration {
        self.min
    }
}

pub(crate) struct ReconnectController {
    state: ConnectionState,
    failures: u32,
    backoff: Backoff,
}

impl ReconnectController {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failures: 0,
            backoff: Backoff::new(timing.min_retry_interval, timing.max_retry_interval),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay the next failure would schedule.
    #[cfg(test)]
    pub fn next_delay(&self) -> Duration {
        self.backoff.delay(self.failures.saturating_add(1))
    }

    /// A poll is about to be issued.
    pub fn on_attempt(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Retrying;
        }
    }

    /// A poll succeeded. Returns `true` if this (re)established the connection.
    pub fn on_success(&mut self) -> bool {
        let reconnected = self.state != ConnectionState::Connected;
        self.state = ConnectionState::Connected;
        self.failures = 0;
        reconnected
    }

    /// A poll failed. Returns the delay before the next attempt and whether
    /// an established connection was lost.
    pub fn on_failure(&mut self) -> (Duration, bool) {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        self.failures = self.failures.saturating_add(1);
        (self.backoff.delay(self.failures), was_connected)
    }
}
