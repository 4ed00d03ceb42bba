//! Session Events
//!
//! Fan-out of session events to subscribers. Delivery happens on a
//! dedicated task, so a handler can call back into the session without
//! re-entering the dispatcher.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::net::{ConnectionState, SessionFailure, TransportKind};
use crate::transcript::TranscriptSnapshot;

/// Events published over the lifetime of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    /// Connection lifecycle transition.
    Connection(ConnectionState),
    /// The fallback chain switched transports.
    TransportChanged(TransportKind),
    /// The transcript changed; carries the full current snapshot.
    TranscriptUpdated(TranscriptSnapshot),
    /// Capture stopped because the device went away.
    CaptureFailed(String),
    /// The connection failed permanently.
    Fatal(SessionFailure),
    Stopped,
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Queue-backed event fan-out.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<SessionEvent>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventDispatcher {
    /// Spawn the delivery task. Must be called within a runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        let handlers: Arc<RwLock<Vec<EventHandler>>> = Arc::new(RwLock::new(Vec::new()));

        let for_task = handlers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Handlers run outside the lock; subscribing from inside a
                // handler cannot deadlock.
                let current: Vec<EventHandler> = for_task.read().clone();
                for handler in &current {
                    handler(&event);
                }
            }
        });

        Self { tx, handlers }
    }

    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().push(handler);
    }

    /// Queue one event for delivery. Never blocks the caller.
    pub fn dispatch(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
