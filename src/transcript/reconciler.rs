//! Transcription Reconciler
//!
//! Turns the recognizer's partial/final event stream into a stable
//! transcript. Reconciliation is identity-based: events are matched to
//! entries by utterance id, never by text similarity.

use std::collections::BTreeMap;
use std::time::Instant;

use uuid::Uuid;

use super::retention::{RetentionBuffer, SealedEntry};

/// One incremental recognition result, in per-session sequence order.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEvent {
    /// Backend-assigned utterance identity. `None` when the backend does
    /// not supply stable ids; the reconciler then uses its synthesized
    /// turn id.
    pub utterance_id: Option<String>,
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
    /// Strictly increasing per session.
    pub seq: u64,
}

/// The single open (not yet finalized) entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenEntry {
    pub utterance_id: String,
    pub text: String,
    pub confidence: Option<f32>,
    pub last_seq: u64,
}

/// Immutable view of the transcript handed to external readers.
#[derive(Debug, Clone, Default)]
pub struct TranscriptSnapshot {
    pub sealed: Vec<SealedEntry>,
    pub open: Option<OpenEntry>,
}

impl TranscriptSnapshot {
    /// Sealed texts in seal order, plus the open entry if any.
    pub fn accumulated_text(&self) -> String {
        let mut parts: Vec<&str> = self.sealed.iter().map(|e| e.text.as_str()).collect();
        if let Some(open) = &self.open {
            parts.push(open.text.as_str());
        }
        parts.join(" ")
    }
}

/// Per-session reconciler. Single writer to its retention buffer; events
/// are processed strictly in arrival order.
pub struct TranscriptionReconciler {
    retention: RetentionBuffer,
    open: Option<OpenEntry>,
    /// Next expected event sequence number.
    next_seq: u64,
    /// Out-of-order events awaiting their turn.
    pending: BTreeMap<u64, TranscriptionEvent>,
    /// Reorder window in sequence numbers.
    window: u64,
    /// Synthesized turn id for backends without utterance ids.
    synthetic_id: String,
    /// Sequence gaps skipped so far, for diagnostics.
    gaps: u64,
}

impl TranscriptionReconciler {
    pub fn new(retention: RetentionBuffer, reorder_window: u64) -> Self {
        Self {
            retention,
            open: None,
            next_seq: 0,
            pending: BTreeMap::new(),
            window: reorder_window.max(1),
            synthetic_id: Uuid::new_v4().to_string(),
            gaps: 0,
        }
    }

    /// Consume one event, reordering within the window.
    pub fn on_event(&mut self, event: TranscriptionEvent) {
        if event.seq < self.next_seq {
            tracing::warn!(
                "dropping stale event seq {} (expected {})",
                event.seq,
                self.next_seq
            );
            return;
        }

        self.pending.insert(event.seq, event);
        self.drain_ready();

        // A gap larger than the window will never fill; skip past it so
        // the transcript keeps flowing. Recoverable, logged.
        if let Some(&oldest) = self.pending.keys().next() {
            let newest = *self.pending.keys().next_back().unwrap_or(&oldest);
            if newest.saturating_sub(self.next_seq) > self.window {
                self.gaps += 1;
                tracing::warn!(
                    "sequence gap: skipping {}..{} after reorder window overflow",
                    self.next_seq,
                    oldest
                );
                self.next_seq = oldest;
                self.drain_ready();
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Some(event) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            self.apply(event);
        }
    }

    fn apply(&mut self, event: TranscriptionEvent) {
        let id = event
            .utterance_id
            .clone()
            .unwrap_or_else(|| self.synthetic_id.clone());
        let synthetic = event.utterance_id.is_none();

        if event.is_final {
            // Atomic seal: the open representation is replaced by the
            // sealed one in a single transition.
            let matches_open = self
                .open
                .as_ref()
                .map(|open| open.utterance_id == id)
                .unwrap_or(false);
            if matches_open {
                self.open = None;
            }
            self.retention.push(SealedEntry {
                utterance_id: id,
                text: event.text,
                confidence: event.confidence,
                seq: event.seq,
                sealed_at: Instant::now(),
            });
            if synthetic {
                self.rotate_synthetic_id();
            }
            return;
        }

        match &mut self.open {
            Some(open) if open.utterance_id == id => {
                // Identity match: the partial updates the open entry.
                open.text = event.text;
                open.confidence = event.confidence;
                open.last_seq = event.seq;
            }
            Some(open) => {
                // A new utterance opened before the previous one was
                // finalized. Seal the orphan with its last partial text
                // so it cannot silently vanish.
                tracing::warn!(
                    "utterance {} superseded before final; sealing as-is",
                    open.utterance_id
                );
                let orphan = open.clone();
                self.retention.push(SealedEntry {
                    utterance_id: orphan.utterance_id,
                    text: orphan.text,
                    confidence: orphan.confidence,
                    seq: orphan.last_seq,
                    sealed_at: Instant::now(),
                });
                self.open = Some(OpenEntry {
                    utterance_id: id,
                    text: event.text,
                    confidence: event.confidence,
                    last_seq: event.seq,
                });
            }
            None => {
                self.open = Some(OpenEntry {
                    utterance_id: id,
                    text: event.text,
                    confidence: event.confidence,
                    last_seq: event.seq,
                });
            }
        }
    }

    /// Voice-activity silence gap: the current synthesized turn is over.
    ///
    /// Only meaningful for backends without utterance ids. An open entry
    /// on the synthesized id is sealed, since no final will ever arrive
    /// for it.
    pub fn on_silence_gap(&mut self) {
        let open_is_synthetic = self
            .open
            .as_ref()
            .map(|open| open.utterance_id == self.synthetic_id)
            .unwrap_or(false);
        if open_is_synthetic {
            if let Some(open) = self.open.take() {
                tracing::debug!("silence gap seals synthesized turn {}", open.utterance_id);
                self.retention.push(SealedEntry {
                    utterance_id: open.utterance_id,
                    text: open.text,
                    confidence: open.confidence,
                    seq: open.last_seq,
                    sealed_at: Instant::now(),
                });
            }
        }
        self.rotate_synthetic_id();
    }

    fn rotate_synthetic_id(&mut self) {
        self.synthetic_id = Uuid::new_v4().to_string();
    }

    /// Concatenation of sealed entries in order plus the open entry.
    pub fn accumulated_text(&self) -> String {
        self.snapshot().accumulated_text()
    }

    /// Immutable snapshot for external readers.
    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            sealed: self.retention.snapshot(),
            open: self.open.clone(),
        }
    }

    /// Sequence gaps skipped so far.
    pub fn gap_count(&self) -> u64 {
        self.gaps
    }
}
