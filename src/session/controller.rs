//! Session Controller
//!
//! Ties capture, connection and transcript together into one start/stop
//! lifecycle and publishes session events to subscribers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::audio::{AudioError, AudioSource, CapturePipeline, CpalSource, FrameQueue};
use crate::config::{ConfigError, SessionConfig};
use crate::net::{
    audio_message, default_transport_factory, ConnectionError, ConnectionEvent, ConnectionManager,
    ConnectionSession, SendPriority, TransportFactory,
};
use crate::transcript::{RetentionBuffer, TranscriptSnapshot, TranscriptionReconciler};

use super::events::{EventDispatcher, EventHandler, SessionEvent};

/// Session-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct RunningSession {
    capture: Arc<CapturePipeline>,
    manager: Arc<ConnectionManager>,
    pump: JoinHandle<()>,
    fan_in: JoinHandle<()>,
}

/// One transcription session from microphone to transcript.
///
/// `start` wires capture into the connection manager and begins streaming;
/// `stop` tears everything down in order: capture first so the final flush
/// reaches the backend, then the graceful connection close.
pub struct SessionController {
    config: SessionConfig,
    dispatcher: EventDispatcher,
    transcript: Arc<Mutex<TranscriptionReconciler>>,
    running: Mutex<Option<RunningSession>>,
}

impl SessionController {
    /// Validate the configuration and build an idle controller.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let transcript = Arc::new(Mutex::new(new_reconciler(&config)));
        Ok(Self {
            config,
            dispatcher: EventDispatcher::new(),
            transcript,
            running: Mutex::new(None),
        })
    }

    /// Subscribe to session events. Handlers run on the dispatch task.
    pub fn subscribe(&self, handler: EventHandler) {
        self.dispatcher.subscribe(handler);
    }

    /// Start streaming from the default microphone.
    pub fn start(&self) -> Result<(), SessionError> {
        let source = Box::new(CpalSource::new()?);
        let factory = default_transport_factory(&self.config);
        self.start_with(source, factory)
    }

    /// Start streaming from an explicit source over an explicit transport
    /// factory.
    pub fn start_with(
        &self,
        source: Box<dyn AudioSource>,
        factory: TransportFactory,
    ) -> Result<(), SessionError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SessionError::AlreadyRunning);
        }

        // Fresh transcript per run.
        *self.transcript.lock() = new_reconciler(&self.config);

        let capture = Arc::new(CapturePipeline::new(self.config.audio.clone(), source));
        let queue = capture.start()?;

        let (manager, events) = ConnectionManager::start(self.config.clone(), factory);
        let manager = Arc::new(manager);

        let pump = tokio::spawn(pump_frames(
            queue,
            capture.clone(),
            manager.clone(),
            self.config.clone(),
            self.transcript.clone(),
            self.dispatcher.clone(),
        ));
        let fan_in = tokio::spawn(fan_in_events(
            events,
            self.transcript.clone(),
            self.dispatcher.clone(),
        ));

        *running = Some(RunningSession {
            capture,
            manager,
            pump,
            fan_in,
        });
        drop(running);

        tracing::info!("session started");
        self.dispatcher.dispatch(SessionEvent::Started);
        Ok(())
    }

    /// Stop the session. Idempotent; a second call is a no-op.
    pub async fn stop(&self) {
        let session = self.running.lock().take();
        let Some(session) = session else {
            return;
        };

        // Capture first: the framer flushes its remainder and closes the
        // queue, the pump drains it onto the still-open connection.
        session.capture.stop();
        let _ = session.pump.await;

        session.manager.disconnect().await;

        // Dropping the last manager handle ends the event stream, which
        // lets the fan-in task exit.
        drop(session.manager);
        drop(session.capture);
        let _ = session.fan_in.await;

        tracing::info!("session stopped");
        self.dispatcher.dispatch(SessionEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Current transcript. Valid while running and after stop.
    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.transcript.lock().snapshot()
    }

    /// Connection snapshot of the running session, if any.
    pub fn connection(&self) -> Option<ConnectionSession> {
        self.running
            .lock()
            .as_ref()
            .map(|session| session.manager.session())
    }
}

fn new_reconciler(config: &SessionConfig) -> TranscriptionReconciler {
    let max_age = match config.retention.max_age_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    TranscriptionReconciler::new(
        RetentionBuffer::new(config.retention.max_entries, max_age),
        config.reorder_window,
    )
}

/// Drive captured frames into the connection.
///
/// Silent frames are skipped when voice-activity tagging is enabled, with
/// a periodic low-priority keepalive so the backend sees a live stream.
/// The detector's turn boundary is reported to the reconciler so a
/// synthesized turn can be sealed.
async fn pump_frames(
    queue: FrameQueue,
    capture: Arc<CapturePipeline>,
    manager: Arc<ConnectionManager>,
    config: SessionConfig,
    transcript: Arc<Mutex<TranscriptionReconciler>>,
    dispatcher: EventDispatcher,
) {
    let rate = config.audio.sample_rate;
    let min_samples = (u64::from(rate) * u64::from(config.audio.min_frame_duration_ms)
        / 1000) as usize;
    let keepalive_every = config.audio.vad.keepalive_every_frames.max(1);

    let mut silent_run: u32 = 0;

    while let Some(frame) = queue.pop().await {
        // Undersized frames only occur as the final flush on stop.
        let is_flush = frame.samples.len() < min_samples;

        if frame.turn_boundary {
            let snapshot = {
                let mut reconciler = transcript.lock();
                reconciler.on_silence_gap();
                reconciler.snapshot()
            };
            dispatcher.dispatch(SessionEvent::TranscriptUpdated(snapshot));
        }

        if config.audio.vad.enabled && !frame.is_speech && !is_flush {
            silent_run += 1;
            if silent_run % keepalive_every != 0 {
                continue;
            }
        } else {
            silent_run = 0;
        }

        let priority = if frame.is_speech || is_flush {
            SendPriority::Audio
        } else {
            SendPriority::Low
        };
        match audio_message(&frame, rate, min_samples, is_flush) {
            Ok(message) => {
                if let Err(err) = manager.send(message, priority) {
                    tracing::debug!("dropping frame {}: {}", frame.seq, err);
                }
            }
            Err(err) => {
                tracing::warn!("skipping frame {}: {}", frame.seq, err);
            }
        }
    }

    // The queue only closes on stop or device loss.
    if let Some(failure) = capture.take_failure() {
        tracing::error!("capture failed: {}", failure);
        dispatcher.dispatch(SessionEvent::CaptureFailed(failure.to_string()));
    }
}

/// Fold connection events into the transcript and the session stream.
async fn fan_in_events(
    mut events: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    transcript: Arc<Mutex<TranscriptionReconciler>>,
    dispatcher: EventDispatcher,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(state) => {
                dispatcher.dispatch(SessionEvent::Connection(state));
            }
            ConnectionEvent::TransportChanged(kind) => {
                dispatcher.dispatch(SessionEvent::TransportChanged(kind));
            }
            ConnectionEvent::Transcription(result) => {
                let snapshot = {
                    let mut reconciler = transcript.lock();
                    reconciler.on_event(result);
                    reconciler.snapshot()
                };
                dispatcher.dispatch(SessionEvent::TranscriptUpdated(snapshot));
            }
            ConnectionEvent::Fatal(failure) => {
                dispatcher.dispatch(SessionEvent::Fatal(failure));
            }
        }
    }
}
