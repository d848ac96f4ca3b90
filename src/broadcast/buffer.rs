//! Bounded replay ring

use std::collections::VecDeque;

use bytes::Bytes;

use crate::types::{Event, ReplayGap, ReplayOutcome};

/// The most recent `capacity` events, oldest evicted first
///
/// Sequence numbers are assigned here, so the retained events always form a
/// contiguous run ending at `next_seq - 1`.
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<Event>,
    capacity: usize,
    next_seq: u64,
}

impl ReplayBuffer {
    /// A zero capacity is bumped to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    /// Assign the next seq, store, evict if full
    pub fn append(&mut self, payload: impl Into<Bytes>) -> &Event {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        let event = Event::new(self.next_seq, payload);
        self.next_seq += 1;
        self.events.push_back(event);
        // Just pushed, never empty here
        &self.events[self.events.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Seq the next append will receive
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Oldest retained seq
    pub fn first_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.seq)
    }

    /// Copy of every retained event with `seq >= start`
    pub fn snapshot_from(&self, start: u64) -> ReplayOutcome {
        let Some(first) = self.first_seq() else {
            return ReplayOutcome::default();
        };

        let skip = start.saturating_sub(first).min(self.events.len() as u64) as usize;
        let events = self.events.iter().skip(skip).cloned().collect();
        let gap = (start < first).then_some(ReplayGap {
            requested: start,
            first_available: first,
        });

        ReplayOutcome { events, gap }
    }
}
