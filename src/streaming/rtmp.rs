//! RTMP preview mode (spec §4.9 "RTMP mode").
//!
//! H.264 encoding and FLV muxing are wire-codec concerns out of scope per
//! spec §1; this module treats the pair as one opaque [`RtmpEncoder`] and
//! owns only the feed loop, PTS bookkeeping, and the `Unhealthy` terminal
//! transition on unrecoverable write error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::types::{CameraId, Frame};

pub trait RtmpEncoder: Send + 'static {
    fn connect(&mut self, target_url: &str) -> Result<(), String>;
    /// `pts_ms` is monotonically increasing, derived from the frame's
    /// capture time relative to stream start.
    fn write_frame(&mut self, frame: &Frame, pts_ms: u64) -> Result<(), String>;
}

impl RtmpEncoder for Box<dyn RtmpEncoder> {
    fn connect(&mut self, target_url: &str) -> Result<(), String> {
        (**self).connect(target_url)
    }

    fn write_frame(&mut self, frame: &Frame, pts_ms: u64) -> Result<(), String> {
        (**self).write_frame(frame, pts_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtmpState {
    Connecting,
    Streaming,
    Unhealthy,
    Stopped,
}

struct Shared {
    state: Mutex<RtmpState>,
    running: AtomicBool,
}

/// One per camera in RTMP mode. Re-entry after `Unhealthy` requires a
/// brand new `RtmpStreamer` (spec: "re-entry requires explicit restart").
pub struct RtmpStreamer {
    camera_id: CameraId,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RtmpStreamer {
    pub fn start<E, F>(camera_id: CameraId, target_url: String, mut encoder: E, mut next_frame: F) -> Self
    where
        E: RtmpEncoder,
        F: FnMut() -> Option<Frame> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(RtmpState::Connecting),
            running: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let thread_camera = camera_id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rtmp-{camera_id}"))
            .spawn(move || {
                if let Err(e) = encoder.connect(&target_url) {
                    error!(camera_id = %thread_camera, error = %e, "rtmp connect failed");
                    *thread_shared.state.lock().unwrap() = RtmpState::Unhealthy;
                    return;
                }
                *thread_shared.state.lock().unwrap() = RtmpState::Streaming;
                info!(camera_id = %thread_camera, target = %target_url, "rtmp streaming");

                let mut stream_start: Option<chrono::DateTime<chrono::Utc>> = None;
                while thread_shared.running.load(Ordering::SeqCst) {
                    let Some(frame) = next_frame() else {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        continue;
                    };
                    let start = *stream_start.get_or_insert(frame.capture_time);
                    let pts_ms = (frame.capture_time - start).num_milliseconds().max(0) as u64;

                    if let Err(e) = encoder.write_frame(&frame, pts_ms) {
                        error!(camera_id = %thread_camera, error = %e, "rtmp write failed, marking unhealthy");
                        *thread_shared.state.lock().unwrap() = RtmpState::Unhealthy;
                        thread_shared.running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
                *thread_shared.state.lock().unwrap() = RtmpState::Stopped;
            })
            .expect("failed to spawn rtmp thread");

        RtmpStreamer {
            camera_id,
            shared,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> RtmpState {
        *self.shared.state.lock().unwrap()
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!(camera_id = %self.camera_id, "rtmp streamer stopped");
    }
}

impl Drop for RtmpStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;

    fn frame(seq: u64) -> Frame {
        Frame {
            pixels: StdArc::from(vec![0u8; 4]),
            width: 2,
            height: 2,
            capture_time: chrono::Utc::now(),
            sequence_number: seq,
            camera_id: "cam1".into(),
        }
    }

    struct FakeEncoder {
        fail_after: Option<usize>,
        writes: usize,
    }

    impl RtmpEncoder for FakeEncoder {
        fn connect(&mut self, _target_url: &str) -> Result<(), String> {
            Ok(())
        }

        fn write_frame(&mut self, _frame: &Frame, _pts_ms: u64) -> Result<(), String> {
            self.writes += 1;
            if let Some(fail_after) = self.fail_after {
                if self.writes > fail_after {
                    return Err("simulated write failure".into());
                }
            }
            Ok(())
        }
    }

    #[test]
    fn transitions_to_unhealthy_on_persistent_write_error() {
        let counter = StdArc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let mut streamer = RtmpStreamer::start(
            "cam1".to_string(),
            "rtmp://example.invalid/live".to_string(),
            FakeEncoder { fail_after: Some(2), writes: 0 },
            move || {
                let seq = counter2.fetch_add(1, Ordering::SeqCst) as u64;
                Some(frame(seq))
            },
        );

        for _ in 0..50 {
            if streamer.state() == RtmpState::Unhealthy {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(streamer.state(), RtmpState::Unhealthy);
        streamer.stop();
    }

    #[test]
    fn connect_failure_marks_unhealthy_without_streaming() {
        struct FailingConnect;
        impl RtmpEncoder for FailingConnect {
            fn connect(&mut self, _target_url: &str) -> Result<(), String> {
                Err("no route to host".into())
            }
            fn write_frame(&mut self, _frame: &Frame, _pts_ms: u64) -> Result<(), String> {
                Ok(())
            }
        }

        let mut streamer = RtmpStreamer::start(
            "cam1".to_string(),
            "rtmp://example.invalid/live".to_string(),
            FailingConnect,
            || None,
        );
        for _ in 0..50 {
            if streamer.state() == RtmpState::Unhealthy {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(streamer.state(), RtmpState::Unhealthy);
        streamer.stop();
    }
}
