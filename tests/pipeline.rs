//! Integration Tests for the Capture-to-Transcript Pipeline
//!
//! Exercises the complete flow: AudioSource -> CapturePipeline ->
//! ConnectionManager -> TranscriptionReconciler, with a scripted audio
//! source and a mock transport standing in for the device and the backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use streamscribe::audio::{AudioError, AudioSource, SampleSink, SourceFormat};
use streamscribe::config::SessionConfig;
use streamscribe::net::{
    ClientMessage, ConnectionState, ServerMessage, Transport, TransportError, TransportFactory,
    TransportKind,
};
use streamscribe::session::{SessionController, SessionEvent};

// ============================================================================
// Test Fixtures
// ============================================================================

/// Generate synthetic speech-like audio (harmonics with amplitude
/// modulation), loud enough to clear the voice-activity threshold.
fn speech_like_audio(sample_rate: u32, duration_ms: u32) -> Vec<f32> {
    let num_samples = (sample_rate as u64 * u64::from(duration_ms) / 1000) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let fundamental = (2.0 * std::f32::consts::PI * 120.0 * t).sin();
            let harmonic = 0.5 * (2.0 * std::f32::consts::PI * 240.0 * t).sin();
            let envelope = 0.5 + 0.5 * (2.0 * std::f32::consts::PI * 3.5 * t).sin();
            envelope * (fundamental + harmonic) * 0.3
        })
        .collect()
}

fn silence(sample_rate: u32, duration_ms: u32) -> Vec<f32> {
    vec![0.0; (sample_rate as u64 * u64::from(duration_ms) / 1000) as usize]
}

/// Audio source that hands its sink back to the test for direct feeding.
struct ScriptedSource {
    sink_slot: Arc<Mutex<Option<SampleSink>>>,
}

impl ScriptedSource {
    fn new() -> (Self, Arc<Mutex<Option<SampleSink>>>) {
        let sink_slot = Arc::new(Mutex::new(None));
        (
            Self {
                sink_slot: sink_slot.clone(),
            },
            sink_slot,
        )
    }
}

impl AudioSource for ScriptedSource {
    fn start(&mut self, sink: SampleSink) -> Result<SourceFormat, AudioError> {
        *self.sink_slot.lock() = Some(sink);
        Ok(SourceFormat {
            sample_rate: 16_000,
            channels: 1,
        })
    }

    fn stop(&mut self) {
        *self.sink_slot.lock() = None;
    }
}

fn feed(sink_slot: &Arc<Mutex<Option<SampleSink>>>, samples: &[f32]) {
    let sink = sink_slot.lock().clone();
    if let Some(sink) = sink {
        sink(samples);
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

type Inbound = Result<Option<ServerMessage>, TransportError>;

struct MockTransport {
    kind: TransportKind,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    refuse_connects: bool,
}

#[derive(Clone)]
struct MockHandle {
    kind: TransportKind,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl MockHandle {
    fn push(&self, message: ServerMessage) {
        let _ = self.inbound_tx.send(Ok(Some(message)));
    }

    fn audio_frames(&self) -> Vec<(u64, String)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Audio { seq, data, .. } => Some((*seq, data.clone())),
                _ => None,
            })
            .collect()
    }

    fn end_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m, ClientMessage::End))
            .count()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.refuse_connects {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        if let ClientMessage::Setup { .. } = message {
            let _ = self
                .inbound_tx
                .send(Ok(Some(ServerMessage::SetupAck { session: None })));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        match self.inbound_rx.recv().await {
            Some(result) => result,
            None => Ok(None),
        }
    }

    async fn close(&mut self) {}
}

fn mock_factory(refuse_connects: bool) -> (TransportFactory, Arc<Mutex<Vec<MockHandle>>>) {
    let created: Arc<Mutex<Vec<MockHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let record = created.clone();
    let factory: TransportFactory = Arc::new(move |kind| {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        record.lock().push(MockHandle {
            kind,
            sent: sent.clone(),
            inbound_tx: inbound_tx.clone(),
        });
        Box::new(MockTransport {
            kind,
            sent,
            inbound_tx,
            inbound_rx,
            refuse_connects,
        })
    });
    (factory, created)
}

// ============================================================================
// Harness
// ============================================================================

fn config() -> SessionConfig {
    let mut config = SessionConfig {
        endpoint: "wss://recognizer.example.com/v1/stream".into(),
        ..Default::default()
    };
    config.credentials.api_key = "test-key".into();
    config.audio.frame_duration_ms = 100;
    config.audio.min_frame_duration_ms = 100;
    config.audio.vad.silence_gap_ms = 300;
    config.escalation_threshold = 2;
    config.backoff.base_delay_ms = 10;
    config.backoff.max_delay_ms = 50;
    config.backoff.jitter_percent = 0;
    config.backoff.max_attempts = 3;
    config
}

struct Harness {
    controller: SessionController,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    sink: Arc<Mutex<Option<SampleSink>>>,
    transports: Arc<Mutex<Vec<MockHandle>>>,
}

fn start_session(config: SessionConfig, refuse_connects: bool) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let controller = SessionController::new(config).unwrap();
    let (event_tx, events) = mpsc::unbounded_channel();
    controller.subscribe(Arc::new(move |event: &SessionEvent| {
        let _ = event_tx.send(event.clone());
    }));

    let (source, sink) = ScriptedSource::new();
    let (factory, transports) = mock_factory(refuse_connects);
    controller.start_with(Box::new(source), factory).unwrap();

    Harness {
        controller,
        events,
        sink,
        transports,
    }
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, what: &str, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event stream ended waiting for {what}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_streaming(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    wait_for(events, "streaming", |e| {
        matches!(e, SessionEvent::Connection(ConnectionState::Streaming))
    })
    .await;
}

/// Poll until `pred` holds, advancing virtual time while waiting.
async fn wait_until<F: Fn() -> bool>(what: &str, pred: F) {
    timeout(Duration::from_secs(10), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

fn partial(id: &str, text: &str, seq: u64) -> ServerMessage {
    ServerMessage::Partial {
        utterance_id: Some(id.into()),
        text: text.into(),
        confidence: Some(0.5),
        seq,
    }
}

fn final_msg(id: &str, text: &str, seq: u64) -> ServerMessage {
    ServerMessage::Final {
        utterance_id: Some(id.into()),
        text: text.into(),
        confidence: Some(0.9),
        seq,
    }
}

// ============================================================================
// Audio path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_speech_flows_as_ordered_audio_messages() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    for _ in 0..3 {
        feed(&h.sink, &speech_like_audio(16_000, 100));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let transport = h.transports.lock()[0].clone();
    wait_until("three audio frames sent", || {
        transport.audio_frames().len() >= 3
    })
    .await;

    let frames = transport.audio_frames();
    let seqs: Vec<u64> = frames.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(&seqs[..3], &[0, 1, 2]);

    h.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_short_remainder_flushed_padded_on_stop() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    feed(&h.sink, &speech_like_audio(16_000, 100));
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Half a frame left unflushed until stop.
    feed(&h.sink, &speech_like_audio(16_000, 50));
    h.controller.stop().await;

    let transport = h.transports.lock()[0].clone();
    let frames = transport.audio_frames();
    assert_eq!(frames.len(), 2);

    // The flush is padded with silence to the 100ms protocol minimum:
    // 1600 samples of 16-bit PCM, base64 of 3200 bytes.
    use base64::Engine;
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(&frames[1].1)
        .unwrap();
    assert_eq!(pcm.len(), 3200);
    assert!(pcm[2400..].iter().all(|&b| b == 0));
}

// ============================================================================
// Transcript reconciliation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_partials_update_finals_seal_exactly_once() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    let backend = h.transports.lock()[0].clone();
    backend.push(partial("u1", "hello", 0));
    backend.push(partial("u1", "hello world", 1));
    backend.push(final_msg("u1", "hello world", 2));
    backend.push(final_msg("u2", "goodbye", 3));

    let snapshot = loop {
        let event = wait_for(&mut h.events, "transcript update", |e| {
            matches!(e, SessionEvent::TranscriptUpdated(_))
        })
        .await;
        let SessionEvent::TranscriptUpdated(snapshot) = event else {
            unreachable!();
        };
        if snapshot.sealed.len() == 2 {
            break snapshot;
        }
    };

    // Two entries, each sealed exactly once, partials merged by identity.
    assert_eq!(snapshot.sealed[0].text, "hello world");
    assert_eq!(snapshot.sealed[1].text, "goodbye");
    assert!(snapshot.open.is_none());
    assert_eq!(snapshot.accumulated_text(), "hello world goodbye");

    h.controller.stop().await;

    // The transcript survives the stop.
    let after = h.controller.snapshot();
    assert_eq!(after.accumulated_text(), "hello world goodbye");
}

#[tokio::test(start_paused = true)]
async fn test_retention_evicts_oldest_but_not_open_entry() {
    let mut cfg = config();
    cfg.retention.max_entries = 2;
    let mut h = start_session(cfg, false);
    wait_streaming(&mut h.events).await;

    let backend = h.transports.lock()[0].clone();
    backend.push(final_msg("u1", "one", 0));
    backend.push(final_msg("u2", "two", 1));
    backend.push(partial("u9", "still open", 2));
    backend.push(final_msg("u3", "three", 3));

    wait_until("retention settled", || {
        let snapshot = h.controller.snapshot();
        snapshot.sealed.len() == 2 && snapshot.sealed[1].text == "three"
    })
    .await;

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.sealed[0].text, "two");
    assert_eq!(snapshot.sealed[1].text, "three");
    assert_eq!(snapshot.open.unwrap().text, "still open");

    h.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_silence_gap_seals_anonymous_turn() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    // Speech first so the silence run starts fresh.
    for _ in 0..2 {
        feed(&h.sink, &speech_like_audio(16_000, 100));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let backend = h.transports.lock()[0].clone();
    backend.push(ServerMessage::Partial {
        utterance_id: None,
        text: "trailing words".into(),
        confidence: None,
        seq: 0,
    });
    wait_until("open entry visible", || {
        h.controller.snapshot().open.is_some()
    })
    .await;

    // 300ms of silence plus the hangover frames crosses the gap.
    for _ in 0..8 {
        feed(&h.sink, &silence(16_000, 100));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    wait_until("turn sealed by silence", || {
        let snapshot = h.controller.snapshot();
        snapshot.open.is_none() && snapshot.sealed.len() == 1
    })
    .await;
    assert_eq!(h.controller.snapshot().sealed[0].text, "trailing words");

    h.controller.stop().await;
}

// ============================================================================
// Fallback and recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_protocol_failures_escalate_and_old_transport_goes_quiet() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    let first = h.transports.lock()[0].clone();
    first.push(ServerMessage::Error {
        code: 422,
        message: "unsupported frame".into(),
    });
    first.push(ServerMessage::Error {
        code: 422,
        message: "unsupported frame".into(),
    });

    let event = wait_for(&mut h.events, "transport change", |e| {
        matches!(e, SessionEvent::TransportChanged(_))
    })
    .await;
    assert!(matches!(
        event,
        SessionEvent::TransportChanged(TransportKind::HttpStream)
    ));
    wait_streaming(&mut h.events).await;

    let first_sent = first.sent.lock().len();
    feed(&h.sink, &speech_like_audio(16_000, 100));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = h.transports.lock()[1].clone();
    assert_eq!(second.kind, TransportKind::HttpStream);
    wait_until("audio on fallback transport", || {
        !second.audio_frames().is_empty()
    })
    .await;
    // Nothing further reaches the escalated-away transport.
    assert_eq!(first.sent.lock().len(), first_sent);

    h.controller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_refusals_exhaust_into_fatal() {
    let mut h = start_session(config(), true);

    let event = wait_for(&mut h.events, "fatal", |e| {
        matches!(e, SessionEvent::Fatal(_))
    })
    .await;
    let SessionEvent::Fatal(failure) = event else {
        unreachable!();
    };
    assert!(failure.reason.contains("gave up"));
    assert_eq!(failure.retry_count, 3);

    // Stop still works after the connection died.
    h.controller.stop().await;
    assert!(!h.controller.is_running());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_ends_once() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    feed(&h.sink, &speech_like_audio(16_000, 100));
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.controller.stop().await;
    h.controller.stop().await;

    let transport = h.transports.lock()[0].clone();
    assert_eq!(transport.end_count(), 1);
    assert!(!h.controller.is_running());
    assert!(h.controller.connection().is_none());

    wait_for(&mut h.events, "stopped", |e| {
        matches!(e, SessionEvent::Stopped)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_gets_fresh_transcript() {
    let mut h = start_session(config(), false);
    wait_streaming(&mut h.events).await;

    let backend = h.transports.lock()[0].clone();
    backend.push(final_msg("u1", "first run", 0));
    wait_until("first run sealed", || {
        h.controller.snapshot().sealed.len() == 1
    })
    .await;

    h.controller.stop().await;

    let (source, _sink) = ScriptedSource::new();
    let (factory, _transports) = mock_factory(false);
    h.controller.start_with(Box::new(source), factory).unwrap();
    wait_streaming(&mut h.events).await;

    assert!(h.controller.snapshot().sealed.is_empty());
    h.controller.stop().await;
}
