//! Retention Buffer
//!
//! Bounded FIFO store of sealed transcript entries.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A finalized, immutable utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedEntry {
    pub utterance_id: String,
    pub text: String,
    pub confidence: Option<f32>,
    /// Sequence number of the sealing event.
    pub seq: u64,
    /// When the entry was sealed, for age-based eviction.
    pub sealed_at: Instant,
}

/// Bounded, ordered store of sealed entries.
///
/// Evicts oldest-first when either the count or the age limit is
/// exceeded. The currently open entry lives outside this buffer and is
/// never evicted.
pub struct RetentionBuffer {
    entries: VecDeque<SealedEntry>,
    max_entries: usize,
    max_age: Option<Duration>,
}

impl RetentionBuffer {
    pub fn new(max_entries: usize, max_age: Option<Duration>) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Append a sealed entry, evicting the oldest entries as needed.
    pub fn push(&mut self, entry: SealedEntry) {
        self.evict_expired(Instant::now());
        while self.entries.len() >= self.max_entries {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!("evicting sealed entry {}", evicted.utterance_id);
            }
        }
        self.entries.push_back(entry);
    }

    /// Drop entries older than the age limit.
    pub fn evict_expired(&mut self, now: Instant) {
        let Some(max_age) = self.max_age else {
            return;
        };
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.sealed_at) > max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_fresh(&self, entry: &SealedEntry, now: Instant) -> bool {
        match self.max_age {
            Some(max_age) => now.duration_since(entry.sealed_at) <= max_age,
            None => true,
        }
    }

    /// Live entries, oldest first. Entries past the age limit are hidden
    /// even before the next push evicts them.
    pub fn iter(&self) -> impl Iterator<Item = &SealedEntry> {
        let now = Instant::now();
        self.entries.iter().filter(move |e| self.is_fresh(e, now))
    }

    /// Immutable copy of the live sealed entries, oldest first.
    pub fn snapshot(&self) -> Vec<SealedEntry> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| self.is_fresh(e, now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
