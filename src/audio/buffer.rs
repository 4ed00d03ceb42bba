//! Audio Buffers
//!
//! Drop-oldest circular buffer for raw samples and the bounded frame
//! queue decoupling capture from the network consumer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::AudioFrame;

/// Ring buffer for raw audio samples.
///
/// Sized to ~2x the target frame duration to absorb jitter between the
/// capture callback and the framer. When full, the oldest samples are
/// overwritten so that the newest live audio is always retained.
pub struct RingBuffer {
    data: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    count: usize,
    dropped: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            write_pos: 0,
            read_pos: 0,
            count: 0,
            dropped: 0,
        }
    }

    /// Write samples, overwriting the oldest buffered samples when full.
    pub fn write(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.data[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.data.len();

            if self.count < self.data.len() {
                self.count += 1;
            } else {
                // Buffer full: advance the read position, dropping the
                // oldest sample in favor of the newest live audio.
                self.read_pos = (self.read_pos + 1) % self.data.len();
                self.dropped += 1;
            }
        }
    }

    /// Remove and return up to `max` samples, oldest first.
    pub fn take(&mut self, max: usize) -> Vec<f32> {
        let n = max.min(self.count);
        let mut result = Vec::with_capacity(n);

        for _ in 0..n {
            result.push(self.data[self.read_pos]);
            self.read_pos = (self.read_pos + 1) % self.data.len();
        }
        self.count -= n;

        result
    }

    /// Remove and return all buffered samples.
    pub fn drain(&mut self) -> Vec<f32> {
        let count = self.count;
        self.take(count)
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Total samples overwritten due to backpressure since creation.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped
    }
}

/// Bounded queue of [`AudioFrame`]s between the framer and the consumer.
///
/// `push` never blocks: when the queue is full the oldest frame is
/// discarded so a slow consumer can never stall capture. `pop` awaits the
/// next frame or queue close.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<FrameQueueInner>,
}

struct FrameQueueInner {
    frames: Mutex<FrameQueueState>,
    notify: Notify,
    capacity: usize,
}

struct FrameQueueState {
    queue: VecDeque<AudioFrame>,
    closed: bool,
    dropped: u64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FrameQueueInner {
                frames: Mutex::new(FrameQueueState {
                    queue: VecDeque::with_capacity(capacity),
                    closed: false,
                    dropped: 0,
                }),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Enqueue a frame, dropping the oldest queued frame when full.
    pub fn push(&self, frame: AudioFrame) {
        {
            let mut state = self.inner.frames.lock();
            if state.closed {
                return;
            }
            if state.queue.len() >= self.inner.capacity {
                state.queue.pop_front();
                state.dropped += 1;
                tracing::warn!(
                    "frame queue full, dropped oldest frame ({} dropped total)",
                    state.dropped
                );
            }
            state.queue.push_back(frame);
        }
        self.inner.notify.notify_one();
    }

    /// Await the next frame. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.frames.lock();
                if let Some(frame) = state.queue.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Queued frames remain poppable; further pushes are
    /// discarded.
    pub fn close(&self) {
        self.inner.frames.lock().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Frames discarded due to backpressure.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.frames.lock().dropped
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.frames.lock().queue.len()
    }

    /// Whether no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; 16],
            seq,
            timestamp: Duration::from_millis(seq * 100),
            duration: Duration::from_millis(100),
            is_speech: true,
            turn_boundary: false,
        }
    }

    #[test]
    fn test_ring_write_take() {
        let mut buffer = RingBuffer::new(10);

        buffer.write(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.len(), 3);

        let samples = buffer.take(2);
        assert_eq!(samples, vec![1.0, 2.0]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_ring_overflow_drops_oldest() {
        let mut buffer = RingBuffer::new(5);

        buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.dropped_samples(), 2);

        let samples = buffer.drain();
        assert_eq!(samples, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_ring_drain_empties() {
        let mut buffer = RingBuffer::new(10);

        buffer.write(&[1.0, 2.0, 3.0]);
        let samples = buffer.drain();

        assert_eq!(samples, vec![1.0, 2.0, 3.0]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_queue_fifo_order() {
        let queue = FrameQueue::new(4);
        queue.push(frame(0));
        queue.push(frame(1));
        queue.push(frame(2));

        assert_eq!(queue.pop().await.unwrap().seq, 0);
        assert_eq!(queue.pop().await.unwrap().seq, 1);
        assert_eq!(queue.pop().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = FrameQueue::new(2);
        queue.push(frame(0));
        queue.push(frame(1));
        queue.push(frame(2));

        assert_eq!(queue.dropped_frames(), 1);
        assert_eq!(queue.pop().await.unwrap().seq, 1);
        assert_eq!(queue.pop().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_queue_close_drains_then_ends() {
        let queue = FrameQueue::new(4);
        queue.push(frame(0));
        queue.close();
        queue.push(frame(1)); // discarded after close

        assert_eq!(queue.pop().await.unwrap().seq, 0);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_queue_pop_wakes_on_push() {
        let queue = FrameQueue::new(4);
        let popper = queue.clone();

        let handle = tokio::spawn(async move { popper.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(frame(7));

        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.seq, 7);
    }
}
