//! External address announcements
//!
//! After the external address changes the gateway multicasts it ten times,
//! with the gap between announcements doubling from 250ms up to 64s. A new
//! change restarts the sequence from the beginning, cancelling whatever
//! announcement was still pending.

use crate::timer::{TimerEvent, TimerId, Timers};
use std::time::{Duration, Instant};

/// Delay before each announcement of a burst
pub const ANNOUNCE_DELAYS: [Duration; 10] = [
    Duration::ZERO,
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(32),
    Duration::from_secs(64),
];

/// Backoff state machine for address announcements
#[derive(Debug, Default)]
pub struct Announcer {
    /// Position in [`ANNOUNCE_DELAYS`] of the next announcement
    index: usize,
    pending: Option<TimerId>,
}

impl Announcer {
    /// Create an idle announcer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new burst, dropping any announcement still pending
    pub fn restart(&mut self, timers: &mut Timers<TimerEvent>, now: Instant) {
        self.cancel(timers);
        self.index = 0;
        self.pending = Some(timers.arm(now, ANNOUNCE_DELAYS[0], TimerEvent::Announce));
    }

    /// Stop announcing
    pub fn cancel(&mut self, timers: &mut Timers<TimerEvent>) {
        if let Some(id) = self.pending.take() {
            timers.cancel(id);
        }
    }

    /// Record that the pending announcement fired and was sent
    ///
    /// Arms the next announcement unless the burst is complete. Returns
    /// whether another announcement is scheduled.
    pub fn on_sent(&mut self, timers: &mut Timers<TimerEvent>, now: Instant) -> bool {
        self.pending = None;
        self.index += 1;

        match ANNOUNCE_DELAYS.get(self.index) {
            Some(&delay) => {
                self.pending = Some(timers.arm(now, delay, TimerEvent::Announce));
                true
            }
            None => false,
        }
    }

    /// Whether an announcement is scheduled
    pub fn is_active(&self) -> bool {
        self.pending.is_some()
    }

    /// Position in the backoff table
    pub fn index(&self) -> usize {
        self.index
    }
}
