//! One-shot timers for the single-threaded reactor
//!
//! Components never sleep. They arm a deadline on a shared [`Timers`] queue
//! and keep the returned [`TimerId`] so they can cancel it explicitly. The
//! reactor sleeps until [`Timers::next_deadline`] and then drains everything
//! that is due with [`Timers::pop_due`].

use crate::mapping::MappingId;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// What a daemon timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// A mapping reached the end of its lifetime
    Expire(MappingId),
    /// Send the next address announcement
    Announce,
}

/// Handle to an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Queue of pending one-shot timers carrying an event of type `T`
#[derive(Debug)]
pub struct Timers<T> {
    /// Pending timers ordered by deadline, ties broken by arming order
    queue: BTreeMap<(Instant, TimerId), T>,
    /// Deadline of every pending timer, for cancellation
    deadlines: HashMap<TimerId, Instant>,
    next_id: u64,
}

impl<T> Timers<T> {
    /// Create an empty timer queue
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_id: 0,
        }
    }

    /// Arm a timer firing `delay` after `now`
    pub fn arm(&mut self, now: Instant, delay: Duration, event: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let deadline = now + delay;
        self.queue.insert((deadline, id), event);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer, returning its event if it was still pending
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.queue.remove(&(deadline, id))
    }

    /// Whether a timer is armed and has not fired yet
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }

        self.deadlines.remove(&id);
        self.queue.remove(&(deadline, id)).map(|event| (id, event))
    }

    /// Cancel everything
    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}
