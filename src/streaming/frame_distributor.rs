//! Bounded latest-frame distribution shared by MJPEG and RTMP sinks
//! (spec §4.9 "Frame buffer").
//!
//! Built on `tokio::sync::broadcast`, same as the teacher's WebRTC frame
//! fan-out: zero-copy multi-consumer delivery where a slow subscriber lags
//! instead of blocking the producer. On top of the raw channel this adds a
//! "latest frame" accessor that collapses any backlog to the newest entry,
//! which is what MJPEG pacing needs (spec: "collapses backlog to just the
//! newest entry for MJPEG pacing").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::Frame;

#[derive(Debug, Clone, Default)]
pub struct FrameDistributorStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub subscribers: usize,
}

pub struct FrameDistributor {
    tx: broadcast::Sender<Arc<Frame>>,
    latest: Mutex<Option<Arc<Frame>>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl FrameDistributor {
    /// `capacity` bounds the broadcast ring; once full the oldest buffered
    /// frame is dropped for any subscriber that hasn't read it yet.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        FrameDistributor {
            tx,
            latest: Mutex::new(None),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *self.latest.lock() = Some(frame.clone());
        match self.tx.send(frame) {
            Ok(_) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("frame published with no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.tx.subscribe()
    }

    /// Snapshot of the most recently published frame, regardless of
    /// whether any broadcast subscriber has drained it yet.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> FrameDistributorStats {
        FrameDistributorStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
