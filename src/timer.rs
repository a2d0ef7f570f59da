use tracing::trace;

use crate::clock::Instant;

/// Link epoch counter. Every timer remembers the epoch it was armed in.
pub type Epoch = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry<K, P = ()> {
    pub deadline: Instant,
    pub kind: K,
    pub payload: P,
    pub epoch: Epoch,
}

/// Poll-driven deadline store.
///
/// Scheduling a kind replaces whatever was pending for that kind, so a
/// retransmit timer is moved rather than stacked. [`TimerQueue::advance_epoch`]
/// drops everything and invalidates entries that might still be delivered
/// late (see [`TimerQueue::insert`]).
#[derive(Debug)]
pub struct TimerQueue<K, P = ()> {
    entries: Vec<TimerEntry<K, P>>,
    epoch: Epoch,
}

impl<K, P> TimerQueue<K, P>
where
    K: Copy + PartialEq + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            epoch: 0,
        }
    }

    pub fn schedule(&mut self, kind: K, deadline: Instant, payload: P) {
        self.entries.retain(|e| e.kind != kind);
        self.entries.push(TimerEntry {
            deadline,
            kind,
            payload,
            epoch: self.epoch,
        });
    }

    /// Add an entry verbatim, keeping its epoch tag and leaving any other
    /// entry of the same kind in place.
    pub fn insert(&mut self, entry: TimerEntry<K, P>) {
        self.entries.push(entry);
    }

    pub fn cancel(&mut self, kind: K) {
        self.entries.retain(|e| e.kind != kind);
    }

    pub fn deadline(&self, kind: K) -> Option<Instant> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.epoch == self.epoch)
            .map(|e| e.deadline)
    }

    pub fn entry(&self, kind: K) -> Option<&TimerEntry<K, P>> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    /// Drop all pending entries and start a new epoch.
    pub fn advance_epoch(&mut self) {
        self.entries.clear();
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Earliest current-epoch deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.epoch == self.epoch)
            .map(|e| e.deadline)
            .min()
    }

    /// Remove and return the earliest entry due at `now`.
    ///
    /// Entries armed in an older epoch are discarded on the way.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry<K, P>> {
        loop {
            let idx = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.deadline <= now)
                .min_by_key(|(_, e)| e.deadline)
                .map(|(idx, _)| idx)?;
            let entry = self.entries.remove(idx);
            if entry.epoch == self.epoch {
                return Some(entry);
            }
            trace!(kind = ?entry.kind, stale_epoch = entry.epoch, epoch = self.epoch, "dropping stale timer");
        }
    }
}

impl<K, P> Default for TimerQueue<K, P>
where
    K: Copy + PartialEq + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
