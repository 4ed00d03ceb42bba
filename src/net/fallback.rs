//! Transport Fallback
//!
//! Tracks protocol-level failures per transport and escalates along the
//! configured chain. Escalation is monotonic within a session: a transport
//! marked failed is never selected again.

use std::collections::{HashMap, HashSet};

use super::TransportKind;

/// Outcome of recording one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Below the threshold; stay on the current transport.
    Tolerated,
    /// Threshold crossed; switch to this transport.
    Escalated(TransportKind),
    /// Threshold crossed with no transport left in the chain.
    Exhausted,
}

/// Failure counters and escalation state for one session.
pub struct FallbackCoordinator {
    chain: Vec<TransportKind>,
    active: usize,
    threshold: u32,
    counters: HashMap<TransportKind, u32>,
    failed: HashSet<TransportKind>,
}

impl FallbackCoordinator {
    pub fn new(chain: Vec<TransportKind>, threshold: u32) -> Self {
        debug_assert!(!chain.is_empty());
        Self {
            chain,
            active: 0,
            threshold: threshold.max(1),
            counters: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// The transport currently in use.
    pub fn active(&self) -> TransportKind {
        self.chain[self.active]
    }

    /// Transports already marked failed this session.
    pub fn failed(&self) -> &HashSet<TransportKind> {
        &self.failed
    }

    /// Record one protocol-fatal failure against `kind`.
    ///
    /// Crossing the threshold marks the transport failed and advances to
    /// the next non-failed transport in the chain, forward only.
    pub fn record_failure(&mut self, kind: TransportKind) -> FailureOutcome {
        if self.failed.contains(&kind) {
            // Already escalated away from this transport.
            return FailureOutcome::Tolerated;
        }

        let count = self.counters.entry(kind).or_insert(0);
        *count += 1;
        if *count < self.threshold {
            tracing::debug!(
                "protocol failure {}/{} on {}",
                count,
                self.threshold,
                kind
            );
            return FailureOutcome::Tolerated;
        }

        self.failed.insert(kind);
        tracing::warn!("transport {} marked failed after {} failures", kind, count);

        match self.next_active() {
            Some(next) => FailureOutcome::Escalated(next),
            None => FailureOutcome::Exhausted,
        }
    }

    fn next_active(&mut self) -> Option<TransportKind> {
        let start = self.active + 1;
        for idx in start..self.chain.len() {
            if !self.failed.contains(&self.chain[idx]) {
                self.active = idx;
                return Some(self.chain[idx]);
            }
        }
        None
    }

    /// Clear failure counters after sustained success. Failed transports
    /// stay failed for the rest of the session.
    pub fn reset(&mut self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(threshold: u32) -> FallbackCoordinator {
        FallbackCoordinator::new(
            vec![TransportKind::WebSocket, TransportKind::HttpStream],
            threshold,
        )
    }

    #[test]
    fn test_failures_below_threshold_tolerated() {
        let mut fallback = coordinator(3);
        assert_eq!(
            fallback.record_failure(TransportKind::WebSocket),
            FailureOutcome::Tolerated
        );
        assert_eq!(
            fallback.record_failure(TransportKind::WebSocket),
            FailureOutcome::Tolerated
        );
        assert_eq!(fallback.active(), TransportKind::WebSocket);
    }

    #[test]
    fn test_threshold_escalates_to_next_transport() {
        let mut fallback = coordinator(2);
        fallback.record_failure(TransportKind::WebSocket);
        assert_eq!(
            fallback.record_failure(TransportKind::WebSocket),
            FailureOutcome::Escalated(TransportKind::HttpStream)
        );
        assert_eq!(fallback.active(), TransportKind::HttpStream);
        assert!(fallback.failed().contains(&TransportKind::WebSocket));
    }

    #[test]
    fn test_escalation_never_reverts() {
        let mut fallback = coordinator(1);
        fallback.record_failure(TransportKind::WebSocket);
        assert_eq!(fallback.active(), TransportKind::HttpStream);

        // Further failures against the dead transport change nothing.
        assert_eq!(
            fallback.record_failure(TransportKind::WebSocket),
            FailureOutcome::Tolerated
        );
        assert_eq!(fallback.active(), TransportKind::HttpStream);
    }

    #[test]
    fn test_exhaustion_when_chain_ends() {
        let mut fallback = coordinator(1);
        fallback.record_failure(TransportKind::WebSocket);
        assert_eq!(
            fallback.record_failure(TransportKind::HttpStream),
            FailureOutcome::Exhausted
        );
    }

    #[test]
    fn test_reset_clears_counters_but_not_failed() {
        let mut fallback = coordinator(2);
        fallback.record_failure(TransportKind::WebSocket);
        fallback.reset();
        // Counter restarted, one more failure is tolerated again.
        assert_eq!(
            fallback.record_failure(TransportKind::WebSocket),
            FailureOutcome::Tolerated
        );

        fallback.record_failure(TransportKind::WebSocket);
        assert_eq!(fallback.active(), TransportKind::HttpStream);
        fallback.reset();
        assert!(fallback.failed().contains(&TransportKind::WebSocket));
    }
}
