//! Sequence reorder buffer for relay streams.
//!
//! Relay frames travel as independent datagrams and may arrive permuted or
//! duplicated. Each stream tags its frames with a monotonically increasing
//! `seq`; the buffer holds early arrivals in a stash and releases a strictly
//! ordered run every time the expected frame shows up. Duplicates are
//! dropped, each `seq` is released at most once.

use std::collections::BTreeMap;

/// In-order release buffer keyed by `seq`.
#[derive(Debug)]
pub struct SeqBuffer<T> {
    expected: u64,
    stash: BTreeMap<u64, T>,
}

impl<T> SeqBuffer<T> {
    /// Buffer whose first expected sequence number is `first`. Relay line
    /// streams start at 1; raw chunk streams at whatever the sender chose.
    pub fn starting_at(first: u64) -> Self {
        Self {
            expected: first,
            stash: BTreeMap::new(),
        }
    }

    /// Accept a frame and return every frame that is now releasable, in
    /// ascending `seq` order. Late duplicates and stash duplicates return
    /// nothing.
    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        if seq < self.expected || self.stash.contains_key(&seq) {
            return Vec::new();
        }
        self.stash.insert(seq, item);

        let mut ready = Vec::new();
        while let Some(item) = self.stash.remove(&self.expected) {
            ready.push(item);
            self.expected += 1;
        }
        ready
    }

    /// Next sequence number the consumer is waiting on.
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Frames held back waiting for a gap to fill.
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    /// Drain whatever is stashed, gaps and all, in ascending order. Used when
    /// a stream ends and best-effort delivery beats dropping the tail.
    pub fn drain_rest(&mut self) -> Vec<T> {
        let rest: Vec<T> = std::mem::take(&mut self.stash).into_values().collect();
        rest
    }
}

impl<T> Default for SeqBuffer<T> {
    fn default() -> Self {
        Self::starting_at(0)
    }
}
