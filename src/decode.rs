//! FrameDecoder (C4, spec §4.4).
//!
//! Wire codecs (H.264 decode) are out of scope and treated as an opaque
//! backend; this module owns only the lifecycle around it: a lazy,
//! potentially-infinite sequence of [`Frame`]s, a 2-frame drop-oldest bound
//! between the decode thread and its consumer, and `StreamLost` surfaced on
//! persistent read failure so the caller (the pipeline) decides whether to
//! reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::types::{CameraId, Frame};

/// Backend abstraction over the actual RTSP/codec pipeline. Real
/// implementations wrap an external decode library; this crate treats them
/// as opaque per spec §1.
pub trait DecoderBackend: Send + 'static {
    /// Establish the connection. Called once per connect attempt.
    fn connect(&mut self) -> Result<(), String>;
    /// Block for the next decoded frame, or return an error on a read
    /// failure that should be treated as a potentially-recoverable stream
    /// loss.
    fn read_frame(&mut self) -> Result<DecodedPixels, String>;
}

pub struct DecodedPixels {
    pub pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl DecoderBackend for Box<dyn DecoderBackend> {
    fn connect(&mut self) -> Result<(), String> {
        (**self).connect()
    }

    fn read_frame(&mut self) -> Result<DecodedPixels, String> {
        (**self).read_frame()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderState {
    Connecting,
    Streaming,
    Lost(String),
    Stopped,
}

struct Shared {
    queue: Mutex<VecDeque<Frame>>,
    not_empty: Condvar,
    state: Mutex<DecoderState>,
    running: AtomicBool,
    sequence: AtomicU64,
    dropped_count: AtomicU64,
}

const QUEUE_BOUND: usize = 2;

/// Owns the decode thread for one camera. Never blocks its producer thread
/// indefinitely on a slow consumer: when the internal queue is at
/// [`QUEUE_BOUND`], the oldest queued frame is dropped to make room.
pub struct FrameDecoder {
    camera_id: CameraId,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FrameDecoder {
    pub fn start<B: DecoderBackend>(camera_id: CameraId, mut backend: B) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_BOUND)),
            not_empty: Condvar::new(),
            state: Mutex::new(DecoderState::Connecting),
            running: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
        });

        let thread_shared = shared.clone();
        let thread_camera = camera_id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("decode-{camera_id}"))
            .spawn(move || {
                run_decode_loop(thread_camera, &mut backend, &thread_shared);
            })
            .expect("failed to spawn decode thread");

        FrameDecoder {
            camera_id,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.shared.state.lock().unwrap().clone()
    }

    /// Block up to `timeout` for the next frame. Returns `None` on timeout
    /// or once the decoder has stopped with an empty queue.
    pub fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                return None;
            }
            let (guard, result) = self
                .shared
                .not_empty
                .wait_timeout(queue, timeout)
                .unwrap();
            queue = guard;
            if result.timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped_count.load(Ordering::SeqCst)
    }

    /// Signal the decode thread to stop and join it. Idempotent.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.not_empty.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.shared.state.lock().unwrap() = DecoderState::Stopped;
        debug!(camera_id = %self.camera_id, "decoder stopped");
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_decode_loop<B: DecoderBackend>(camera_id: CameraId, backend: &mut B, shared: &Arc<Shared>) {
    if let Err(e) = backend.connect() {
        warn!(camera_id = %camera_id, error = %e, "decoder failed to connect");
        *shared.state.lock().unwrap() = DecoderState::Lost(e);
        shared.running.store(false, Ordering::SeqCst);
        return;
    }
    *shared.state.lock().unwrap() = DecoderState::Streaming;
    info!(camera_id = %camera_id, "decoder streaming");

    while shared.running.load(Ordering::SeqCst) {
        match backend.read_frame() {
            Ok(decoded) => {
                let seq = shared.sequence.fetch_add(1, Ordering::SeqCst);
                let frame = Frame {
                    pixels: decoded.pixels,
                    width: decoded.width,
                    height: decoded.height,
                    capture_time: chrono::Utc::now(),
                    sequence_number: seq,
                    camera_id: camera_id.clone(),
                };
                let mut queue = shared.queue.lock().unwrap();
                if queue.len() >= QUEUE_BOUND {
                    queue.pop_front();
                    shared.dropped_count.fetch_add(1, Ordering::SeqCst);
                }
                queue.push_back(frame);
                shared.not_empty.notify_one();
            }
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "decoder read failure, surfacing StreamLost");
                *shared.state.lock().unwrap() = DecoderState::Lost(e);
                shared.running.store(false, Ordering::SeqCst);
                shared.not_empty.notify_all();
                return;
            }
        }
    }
}

/// Convenience conversion for callers that want to bubble decoder loss as
/// an [`AppError`].
pub fn state_to_error(camera_id: &CameraId, state: &DecoderState) -> Option<AppError> {
    match state {
        DecoderState::Lost(reason) => Some(AppError::StreamLost {
            camera_id: camera_id.clone(),
            reason: reason.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        frames_remaining: usize,
        fail_after: Option<usize>,
        produced: Arc<AtomicUsize>,
    }

    impl DecoderBackend for FakeBackend {
        fn connect(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<DecodedPixels, String> {
            let produced = self.produced.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_after) = self.fail_after {
                if produced >= fail_after {
                    return Err("simulated read failure".into());
                }
            }
            if self.frames_remaining == 0 {
                std::thread::sleep(Duration::from_millis(5));
                return Err("source exhausted".into());
            }
            self.frames_remaining -= 1;
            Ok(DecodedPixels {
                pixels: Arc::from(vec![0u8; 16]),
                width: 4,
                height: 4,
            })
        }
    }

    #[test]
    fn produces_frames_in_monotonic_sequence_order() {
        let backend = FakeBackend {
            frames_remaining: 5,
            fail_after: None,
            produced: Arc::new(AtomicUsize::new(0)),
        };
        let decoder = FrameDecoder::start("cam1".to_string(), backend);
        let mut last_seq = None;
        for _ in 0..5 {
            let frame = decoder.next_frame(Duration::from_secs(1)).expect("frame");
            if let Some(last) = last_seq {
                assert!(frame.sequence_number > last);
            }
            last_seq = Some(frame.sequence_number);
        }
        decoder.stop();
    }

    #[test]
    fn surfaces_stream_lost_on_persistent_failure() {
        let backend = FakeBackend {
            frames_remaining: 0,
            fail_after: Some(0),
            produced: Arc::new(AtomicUsize::new(0)),
        };
        let decoder = FrameDecoder::start("cam1".to_string(), backend);
        // Give the decode thread a moment to observe the failure.
        for _ in 0..50 {
            if matches!(decoder.state(), DecoderState::Lost(_)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(decoder.state(), DecoderState::Lost(_)));
        let err = state_to_error(&"cam1".to_string(), &decoder.state()).unwrap();
        assert_eq!(err.kind(), "StreamLost");
    }

    #[test]
    fn drops_oldest_when_consumer_is_slow() {
        let backend = FakeBackend {
            frames_remaining: 100,
            fail_after: None,
            produced: Arc::new(AtomicUsize::new(0)),
        };
        let decoder = FrameDecoder::start("cam1".to_string(), backend);
        // Don't consume for a while; the queue should never exceed QUEUE_BOUND
        // and drops should be counted instead of the producer blocking forever.
        std::thread::sleep(Duration::from_millis(100));
        assert!(decoder.shared.queue.lock().unwrap().len() <= QUEUE_BOUND);
        assert!(decoder.dropped_count() > 0);
        decoder.stop();
    }
}
