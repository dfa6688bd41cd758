//! Timed events.
//!
//! A [`TimerEvent`] fires on a given turn against a target entity and carries
//! a small opaque payload for the game rules. Events live in a [`TimerQueue`]
//! ordered by fire turn; events due on the same turn fire in the order they
//! were scheduled. The world keeps one global queue and every segment keeps a
//! local one that only runs while that segment is active.

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, Link};
use crate::WorldError;

/// Largest payload a timer may carry.
pub const MAX_TIMER_PAYLOAD: usize = 255;

/// Which queue a new timer goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerScope {
    /// The world-wide queue. May target entities on any segment.
    Global,
    /// The active segment's queue. Must target an entity on that segment.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub fire_turn: u64,
    /// Insertion order within the owning queue; breaks fire-turn ties.
    pub seq: u64,
    pub target: Link,
    /// Event type code. Meaning belongs to the game rules.
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl TimerEvent {
    fn key(&self) -> (u64, u64) {
        (self.fire_turn, self.seq)
    }
}

// ---------------------------------------------------------------------------
// TimerQueue
// ---------------------------------------------------------------------------

/// Events kept sorted by `(fire_turn, seq)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerQueue {
    events: Vec<TimerEvent>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from stored events.
    ///
    /// Fails if the events are not strictly ordered by `(fire_turn, seq)`, if
    /// any `seq` is not below `next_seq`, or if a payload is longer than
    /// [`MAX_TIMER_PAYLOAD`].
    pub fn from_parts(next_seq: u64, events: Vec<TimerEvent>) -> Result<Self, WorldError> {
        if let Some(event) = events.iter().find(|e| e.payload.len() > MAX_TIMER_PAYLOAD) {
            return Err(WorldError::PayloadTooLarge {
                len: event.payload.len(),
                max: MAX_TIMER_PAYLOAD,
            });
        }
        let ordered = events.windows(2).all(|w| w[0].key() < w[1].key());
        let seq_ok = events.iter().all(|e| e.seq < next_seq);
        if !ordered || !seq_ok {
            return Err(WorldError::TimerOrder);
        }
        Ok(Self { events, next_seq })
    }

    /// Schedule `kind` against `target` on `fire_turn`. Returns the event's
    /// sequence number.
    pub fn schedule(
        &mut self,
        fire_turn: u64,
        target: Identity,
        kind: u16,
        payload: Vec<u8>,
    ) -> Result<u64, WorldError> {
        if payload.len() > MAX_TIMER_PAYLOAD {
            return Err(WorldError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_TIMER_PAYLOAD,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = TimerEvent {
            fire_turn,
            seq,
            target: Link::Resolved(target),
            kind,
            payload,
        };
        // Equal fire turns sort after existing events because seq only grows.
        let at = self
            .events
            .partition_point(|e| e.key() < event.key());
        self.events.insert(at, event);
        Ok(seq)
    }

    /// Remove and return the earliest event due on or before `turn`.
    pub fn pop_due(&mut self, turn: u64) -> Option<TimerEvent> {
        match self.events.first() {
            Some(first) if first.fire_turn <= turn => Some(self.events.remove(0)),
            _ => None,
        }
    }

    /// Put a popped event back with a later fire turn. It keeps its `seq`,
    /// so among events due on `fire_turn` it still sorts by original
    /// insertion.
    pub fn defer(&mut self, mut event: TimerEvent, fire_turn: u64) {
        event.fire_turn = fire_turn;
        let at = self
            .events
            .partition_point(|e| e.key() < event.key());
        self.events.insert(at, event);
    }

    /// The earliest event, if any.
    pub fn peek(&self) -> Option<&TimerEvent> {
        self.events.first()
    }

    /// Events in fire order.
    pub fn iter(&self) -> impl Iterator<Item = &TimerEvent> {
        self.events.iter()
    }

    /// Targets may be rewritten in place; ordering keys must not change.
    pub fn targets_mut(&mut self) -> impl Iterator<Item = &mut Link> {
        self.events.iter_mut().map(|e| &mut e.target)
    }

    /// Keep only events for which `keep` returns `true`.
    pub fn retain(&mut self, keep: impl FnMut(&TimerEvent) -> bool) {
        self.events.retain(keep);
    }

    /// Remove every event, keeping the sequence counter.
    pub fn drain(&mut self) -> Vec<TimerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events still waiting for their target to be found.
    pub fn unresolved(&self) -> usize {
        self.events.iter().filter(|e| e.target.needs_fixup()).count()
    }
}
