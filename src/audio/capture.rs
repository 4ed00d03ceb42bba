//! Audio Capture Pipeline
//!
//! Continuous capture with a worker thread owning the device, plus the
//! framer that turns raw device samples into fixed-duration frames in the
//! target format.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use crate::config::AudioSettings;

use super::buffer::{FrameQueue, RingBuffer};
use super::format::{downmix_to_mono, duration_ms, resample};
use super::vad::EnergyVad;

/// One fixed-duration span of captured audio in the target format.
///
/// Immutable once emitted; consumed exactly once by the connection layer.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono samples at the configured target sample rate.
    pub samples: Vec<f32>,
    /// Monotonic sequence number, starting at 0 per capture run.
    pub seq: u64,
    /// Offset from the start of capture, derived from emitted samples.
    pub timestamp: Duration,
    /// Duration covered by `samples`.
    pub duration: Duration,
    /// Voice-activity verdict for this frame.
    pub is_speech: bool,
    /// A silence gap long enough to end the current turn closed at this
    /// frame.
    pub turn_boundary: bool,
}

/// Audio capture errors.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no usable capture source: {0}")]
    CaptureUnavailable(String),

    #[error("format conversion failed: {0}")]
    FormatConversion(#[from] super::format::FormatError),

    #[error("capture worker error")]
    WorkerError,
}

/// Native format reported by a source when capture starts.
#[derive(Debug, Clone, Copy)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Callback receiving interleaved samples from the device thread.
pub type SampleSink = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Seam for the external capture device.
///
/// Production uses [`CpalSource`]; tests script their own sources.
pub trait AudioSource: Send {
    /// Begin capture, delivering interleaved samples to `sink` from the
    /// source's own execution context.
    fn start(&mut self, sink: SampleSink) -> Result<SourceFormat, AudioError>;

    /// Stop capture and release the device. Idempotent.
    fn stop(&mut self);

    /// Take the pending device failure, if any. A `Some` return means the
    /// source is gone and the pipeline must stop.
    fn take_error(&mut self) -> Option<String> {
        None
    }
}

/// Commands sent to the cpal worker thread.
enum SourceCommand {
    Start(SampleSink),
    Stop,
    Shutdown,
}

/// Microphone source backed by cpal.
///
/// The device and stream live on a dedicated worker thread; the handle
/// only exchanges commands with it, keeping the source Send without
/// touching the non-Send stream type.
pub struct CpalSource {
    command_tx: mpsc::Sender<SourceCommand>,
    worker_handle: Option<JoinHandle<()>>,
    format: SourceFormat,
    last_error: Arc<Mutex<Option<String>>>,
}

impl CpalSource {
    /// Open the default input device.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::CaptureUnavailable("no default input device".into()))?;
        Self::with_device(device)
    }

    /// Open a specific input device by name.
    pub fn with_device_name(name: &str) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .input_devices()
            .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::CaptureUnavailable(format!("device not found: {name}")))?;
        Self::with_device(device)
    }

    fn with_device(device: cpal::Device) -> Result<Self, AudioError> {
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?;

        let format = SourceFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
        };
        let stream_config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        tracing::info!(
            "Capture device: {}Hz, {} channels",
            format.sample_rate,
            format.channels
        );

        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let error_for_worker = last_error.clone();
        let (command_tx, command_rx) = mpsc::channel::<SourceCommand>();

        let worker_handle = std::thread::spawn(move || {
            let mut stream: Option<cpal::Stream> = None;

            loop {
                match command_rx.recv() {
                    Ok(SourceCommand::Start(sink)) => {
                        if stream.is_some() {
                            continue;
                        }
                        *error_for_worker.lock() = None;

                        let error_for_callback = error_for_worker.clone();
                        match device.build_input_stream(
                            &stream_config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                sink(data);
                            },
                            move |err| {
                                tracing::error!("Audio stream error: {}", err);
                                *error_for_callback.lock() = Some(err.to_string());
                            },
                            None,
                        ) {
                            Ok(s) => match s.play() {
                                Ok(()) => {
                                    stream = Some(s);
                                    tracing::info!("Audio capture started");
                                }
                                Err(e) => {
                                    *error_for_worker.lock() = Some(e.to_string());
                                }
                            },
                            Err(e) => {
                                tracing::error!("Failed to build audio stream: {}", e);
                                *error_for_worker.lock() = Some(e.to_string());
                            }
                        }
                    }
                    Ok(SourceCommand::Stop) => {
                        stream = None;
                        tracing::info!("Audio capture stopped");
                    }
                    Ok(SourceCommand::Shutdown) | Err(_) => {
                        drop(stream.take());
                        break;
                    }
                }
            }
        });

        Ok(Self {
            command_tx,
            worker_handle: Some(worker_handle),
            format,
            last_error,
        })
    }

    /// List available input device names.
    pub fn list_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?
            .filter_map(|d| d.name().ok())
            .collect();
        Ok(devices)
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, sink: SampleSink) -> Result<SourceFormat, AudioError> {
        self.command_tx
            .send(SourceCommand::Start(sink))
            .map_err(|_| AudioError::WorkerError)?;
        Ok(self.format)
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(SourceCommand::Stop);
    }

    fn take_error(&mut self) -> Option<String> {
        self.last_error.lock().take()
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SourceCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Capture pipeline: source -> ring buffer -> framer -> frame queue.
///
/// Capture runs on the source's context and is decoupled from the consumer
/// by drop-oldest buffering at both the sample and the frame level, so a
/// slow downstream stage can never block live audio.
pub struct CapturePipeline {
    settings: AudioSettings,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    /// Queue of the current (or most recent) run. Each start builds a
    /// fresh queue; stop closes the old one for good.
    queue: Mutex<FrameQueue>,
    framer_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    running: Arc<Mutex<bool>>,
    failure: Arc<Mutex<Option<AudioError>>>,
}

/// Frames held by the queue before the oldest is dropped.
const FRAME_QUEUE_CAPACITY: usize = 16;

impl CapturePipeline {
    pub fn new(settings: AudioSettings, source: Box<dyn AudioSource>) -> Self {
        Self {
            settings,
            source: Arc::new(Mutex::new(source)),
            queue: Mutex::new(FrameQueue::new(FRAME_QUEUE_CAPACITY)),
            framer_handle: Mutex::new(None),
            running: Arc::new(Mutex::new(false)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin capture and return the frame queue to consume from.
    ///
    /// Fails with `CaptureUnavailable` when the source cannot start.
    pub fn start(&self) -> Result<FrameQueue, AudioError> {
        {
            let mut running = self.running.lock();
            if *running {
                return Ok(self.queue.lock().clone());
            }
            *running = true;
        }

        // The previous run's queue was closed on stop; restarts get a
        // fresh one.
        let queue = FrameQueue::new(FRAME_QUEUE_CAPACITY);
        *self.queue.lock() = queue.clone();

        let frame_duration = Duration::from_millis(u64::from(self.settings.frame_duration_ms));

        // Ring sized ~2x the frame duration at an upper-bound device rate;
        // resized to the real rate once the source reports its format.
        let ring: Arc<Mutex<Option<RingBuffer>>> = Arc::new(Mutex::new(None));

        let ring_for_sink = ring.clone();
        let sink: SampleSink = Arc::new(move |data: &[f32]| {
            if let Some(ring) = ring_for_sink.lock().as_mut() {
                ring.write(data);
            }
        });

        let format = match self.source.lock().start(sink) {
            Ok(format) => format,
            Err(e) => {
                *self.running.lock() = false;
                return Err(e);
            }
        };

        let ring_capacity =
            (format.sample_rate as u64 * u64::from(format.channels) * 2 * frame_duration.as_millis() as u64
                / 1000) as usize;
        *ring.lock() = Some(RingBuffer::new(ring_capacity.max(1)));

        let settings = self.settings.clone();
        let source = self.source.clone();
        let running = self.running.clone();
        let failure = self.failure.clone();

        let framer_queue = queue.clone();
        let handle = tokio::spawn(async move {
            run_framer(
                settings,
                format,
                ring,
                framer_queue,
                source,
                running,
                failure,
                frame_duration,
            )
            .await;
        });
        *self.framer_handle.lock() = Some(handle);

        Ok(queue)
    }

    /// Stop capture.
    ///
    /// Signals the framer, which flushes buffered sub-threshold samples as
    /// one final (possibly short) frame before the queue closes. Idempotent.
    pub fn stop(&self) {
        let was_running = {
            let mut running = self.running.lock();
            std::mem::replace(&mut *running, false)
        };
        if !was_running {
            return;
        }
        self.source.lock().stop();
        // The framer observes `running == false` on its next tick, flushes
        // and closes the queue, then exits on its own.
    }

    /// The device failure that stopped the pipeline, if any.
    pub fn take_failure(&self) -> Option<AudioError> {
        self.failure.lock().take()
    }

    /// Frames dropped by the consumer-side queue under backpressure.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.lock().dropped_frames()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_framer(
    settings: AudioSettings,
    format: SourceFormat,
    ring: Arc<Mutex<Option<RingBuffer>>>,
    queue: FrameQueue,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    running: Arc<Mutex<bool>>,
    failure: Arc<Mutex<Option<AudioError>>>,
    frame_duration: Duration,
) {
    let frame_samples =
        (settings.sample_rate as u64 * frame_duration.as_millis() as u64 / 1000) as usize;

    let mut vad = EnergyVad::new(settings.vad.clone());
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);
    let mut seq: u64 = 0;
    let mut emitted_samples: u64 = 0;

    let mut tick = tokio::time::interval(frame_duration);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // skip the immediate first tick

    loop {
        tick.tick().await;

        let stopping = !*running.lock();

        if let Some(message) = source.lock().take_error() {
            tracing::error!("Capture device lost: {}", message);
            *failure.lock() = Some(AudioError::CaptureUnavailable(message));
            source.lock().stop();
            *running.lock() = false;
            queue.close();
            return;
        }

        let raw = {
            let mut guard = ring.lock();
            match guard.as_mut() {
                Some(ring) => ring.drain(),
                None => Vec::new(),
            }
        };

        if !raw.is_empty() {
            // Target-format conversion; a failed frame is logged and
            // dropped, capture continues.
            let mono = downmix_to_mono(&raw, usize::from(format.channels));
            match resample(&mono, format.sample_rate, settings.sample_rate) {
                Ok(converted) => pending.extend_from_slice(&converted),
                Err(e) => {
                    tracing::warn!("Dropping frame after conversion failure: {}", e);
                }
            }
        }

        // Sub-threshold spans are concatenated: a frame is emitted only
        // once a full frame worth of samples has accumulated.
        while pending.len() >= frame_samples {
            let samples: Vec<f32> = pending.drain(..frame_samples).collect();
            emit_frame(
                &queue,
                &mut vad,
                samples,
                &mut seq,
                &mut emitted_samples,
                settings.sample_rate,
            );
        }

        if stopping {
            // Final flush: whatever is left goes out as one short frame.
            if !pending.is_empty() {
                let samples = std::mem::take(&mut pending);
                emit_frame(
                    &queue,
                    &mut vad,
                    samples,
                    &mut seq,
                    &mut emitted_samples,
                    settings.sample_rate,
                );
            }
            queue.close();
            return;
        }
    }
}

fn emit_frame(
    queue: &FrameQueue,
    vad: &mut EnergyVad,
    samples: Vec<f32>,
    seq: &mut u64,
    emitted_samples: &mut u64,
    sample_rate: u32,
) {
    let duration = Duration::from_millis(duration_ms(samples.len(), sample_rate));
    let timestamp = Duration::from_millis((*emitted_samples * 1000) / u64::from(sample_rate));
    let verdict = vad.classify(&samples, duration);

    *emitted_samples += samples.len() as u64;
    let frame = AudioFrame {
        samples,
        seq: *seq,
        timestamp,
        duration,
        is_speech: verdict.is_speech,
        turn_boundary: verdict.turn_boundary,
    };
    *seq += 1;
    queue.push(frame);
}
