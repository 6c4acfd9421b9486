//! Fixed-capacity FIFO history buffer

use serde::Serialize;
use std::collections::VecDeque;

use crate::error::{EngineError, Result};

/// Bounded history that evicts the oldest entry when full.
///
/// Index 0 is the oldest retained entry. Reads past the end return
/// `EngineError::OutOfRange` instead of clamping.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> HistoryRing<T> {
    /// Create an empty ring. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append an entry, returning the evicted oldest entry on overflow
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.evicted += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries dropped to overflow since creation
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }

    /// Entry at `index`, oldest first
    pub fn get(&self, index: usize) -> Result<&T> {
        self.entries.get(index).ok_or(EngineError::OutOfRange {
            index,
            len: self.entries.len(),
        })
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}
