//! Recorder, the other half of C8 (spec §4.8).
//!
//! Wire codec and container muxing (H.264 in MP4) are out of scope and
//! treated as an opaque [`VideoWriter`] backend, in the same spirit as
//! [`crate::decode::DecoderBackend`]. This module owns trigger handling,
//! pre-roll writeout, stop-condition bookkeeping, and the `EventRecord`
//! handoff.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::collaborators::EventSink;
use crate::recording::ring_buffer::PreEventRingBuffer;
use crate::types::{CameraId, EventRecord, Frame, RingBufferEntry};

/// Opaque clip writer. Real implementations wrap an H.264 encoder and MP4
/// muxer; this crate only sequences calls into it.
pub trait VideoWriter: Send {
    fn open(&mut self, path: &PathBuf, fps: u32, width: u32, height: u32) -> Result<(), String>;
    fn write_frame(&mut self, frame: &Frame) -> Result<(), String>;
    /// Finalize the file. Called exactly once, even after a write error
    /// (bytes written so far are preserved per spec).
    fn close(&mut self) -> Result<(), String>;
}

impl VideoWriter for Box<dyn VideoWriter> {
    fn open(&mut self, path: &PathBuf, fps: u32, width: u32, height: u32) -> Result<(), String> {
        (**self).open(path, fps, width, height)
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), String> {
        (**self).write_frame(frame)
    }

    fn close(&mut self) -> Result<(), String> {
        (**self).close()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_pre_roll_seconds")]
    pub pre_roll_seconds: u32,
    #[serde(default = "default_post_roll_seconds")]
    pub post_roll_seconds: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

fn default_pre_roll_seconds() -> u32 {
    5
}

fn default_post_roll_seconds() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Manual { deadline: DateTime<Utc> },
    Event { deadline: DateTime<Utc> },
}

struct ActiveClip {
    mode: Mode,
    path: PathBuf,
    camera_id: CameraId,
    event_type: String,
    confidence: f32,
    started_at: DateTime<Utc>,
}

/// Per-camera recorder. Not `Sync`: driven from the owning pipeline's
/// fan-out worker, which also owns the ring buffer it reads from.
pub struct Recorder<W: VideoWriter> {
    config: RecorderConfig,
    writer: W,
    active: Option<ActiveClip>,
}

impl<W: VideoWriter> Recorder<W> {
    pub fn new(config: RecorderConfig, writer: W) -> Self {
        Recorder {
            config,
            writer,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Start (or extend) a manual recording of `duration`.
    pub fn trigger_manual(
        &mut self,
        camera_id: &CameraId,
        duration: chrono::Duration,
        ring: &mut PreEventRingBuffer,
        now: DateTime<Utc>,
    ) {
        let deadline = now + duration;
        self.start_or_extend(camera_id, "manual", 1.0, Mode::Manual { deadline }, ring, now);
    }

    /// Start (or extend, resetting the post-roll deadline) a recording
    /// triggered by a behavior event.
    pub fn trigger_event(
        &mut self,
        camera_id: &CameraId,
        event_type: &str,
        confidence: f32,
        ring: &mut PreEventRingBuffer,
        now: DateTime<Utc>,
    ) {
        let deadline = now + chrono::Duration::seconds(self.config.post_roll_seconds as i64);
        self.start_or_extend(
            camera_id,
            event_type,
            confidence,
            Mode::Event { deadline },
            ring,
            now,
        );
    }

    fn start_or_extend(
        &mut self,
        camera_id: &CameraId,
        event_type: &str,
        confidence: f32,
        mode: Mode,
        ring: &mut PreEventRingBuffer,
        now: DateTime<Utc>,
    ) {
        if let Some(active) = &mut self.active {
            let extended = match (&active.mode, &mode) {
                (Mode::Manual { deadline: cur }, Mode::Manual { deadline: new }) => {
                    (*cur).max(*new)
                }
                (Mode::Event { deadline: cur }, Mode::Event { deadline: new }) => {
                    (*cur).max(*new)
                }
                _ => return,
            };
            active.mode = mode_with_deadline(&active.mode, extended);
            info!(camera_id = %camera_id, "recording re-triggered, deadline extended");
            return;
        }

        let timestamp = now.format("%Y%m%d_%H%M%S");
        let path = self.config.output_dir.join(format!(
            "{camera_id}_{event_type}_{timestamp}.mp4"
        ));

        if let Err(e) = self
            .writer
            .open(&path, self.config.fps, self.config.width, self.config.height)
        {
            error!(camera_id = %camera_id, error = %e, "failed to open recording clip");
            return;
        }

        for entry in ring.drain_fifo() {
            if let Err(e) = self.writer.write_frame(&entry.frame) {
                warn!(camera_id = %camera_id, error = %e, "pre-roll write failed");
                break;
            }
        }

        self.active = Some(ActiveClip {
            mode,
            path,
            camera_id: camera_id.clone(),
            event_type: event_type.to_string(),
            confidence,
            started_at: now,
        });
        info!(camera_id = %camera_id, event_type, "recording started");
    }

    /// Feed a live frame to the active clip, if any. No-op when idle.
    pub fn write_live_frame(&mut self, frame: &Frame) {
        if self.active.is_none() {
            return;
        }
        if let Err(e) = self.writer.write_frame(frame) {
            warn!(camera_id = %frame.camera_id, error = %e, "recording write failed, stopping clip");
            self.active.as_mut().unwrap().mode = expired_mode();
        }
    }

    /// Check stop conditions and, if met, finalize the clip and hand the
    /// resulting `EventRecord` to `sink`. Call once per processed frame.
    pub fn tick(&mut self, sink: &dyn EventSink, now: DateTime<Utc>) {
        let Some(active) = &self.active else { return };
        let deadline = match active.mode {
            Mode::Manual { deadline } | Mode::Event { deadline } => deadline,
        };
        if now < deadline {
            return;
        }

        let active = self.active.take().unwrap();
        if let Err(e) = self.writer.close() {
            warn!(camera_id = %active.camera_id, error = %e, "error finalizing clip, bytes so far preserved");
        }
        info!(camera_id = %active.camera_id, path = %active.path.display(), "recording stopped");

        let record = EventRecord {
            camera_id: active.camera_id.clone(),
            event_type: active.event_type,
            path: active.path,
            confidence: active.confidence,
            metadata: HashMap::from([(
                "durationSeconds".to_string(),
                (now - active.started_at).num_seconds().to_string(),
            )]),
            timestamp_utc: now,
        };
        if !sink.insert_event(record) {
            warn!(camera_id = %active.camera_id, "event sink rejected record, clip file retained");
        }
    }

    /// Force-stop on pipeline shutdown, bypassing stop-condition checks.
    pub fn force_stop(&mut self, sink: &dyn EventSink, now: DateTime<Utc>) {
        if self.active.is_some() {
            self.active.as_mut().unwrap().mode = expired_mode();
            self.tick(sink, now);
        }
    }
}

fn mode_with_deadline(mode: &Mode, deadline: DateTime<Utc>) -> Mode {
    match mode {
        Mode::Manual { .. } => Mode::Manual { deadline },
        Mode::Event { .. } => Mode::Event { deadline },
    }
}

fn expired_mode() -> Mode {
    Mode::Manual {
        deadline: DateTime::<Utc>::MIN_UTC,
    }
}

/// Applies bounding boxes, labels, and other overlay decoration to a
/// clone of `frame`. The upstream frame is never mutated (spec §4.8
/// "Overlays"); this is shared with [`crate::streaming`] for live preview.
pub fn overlay_clone(frame: &Frame, render: impl FnOnce(&Frame) -> Frame) -> Frame {
    render(frame)
}

/// Entry used when turning a ring buffer drain into raw frames for a test
/// writer, or when re-deriving the entries a recorder consumed.
pub fn frame_of(entry: &RingBufferEntry) -> &Frame {
    &entry.frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryEventSink;
    use std::sync::Arc;

    fn frame(camera_id: &str, seq: u64) -> Frame {
        Frame {
            pixels: Arc::from(vec![0u8; 4]),
            width: 2,
            height: 2,
            capture_time: Utc::now(),
            sequence_number: seq,
            camera_id: camera_id.to_string(),
        }
    }

    #[derive(Default)]
    struct FakeWriter {
        opened_path: Option<PathBuf>,
        frames_written: usize,
        fail_writes: bool,
        closed: bool,
    }

    impl VideoWriter for FakeWriter {
        fn open(&mut self, path: &PathBuf, _fps: u32, _w: u32, _h: u32) -> Result<(), String> {
            self.opened_path = Some(path.clone());
            Ok(())
        }

        fn write_frame(&mut self, _frame: &Frame) -> Result<(), String> {
            if self.fail_writes {
                return Err("simulated write failure".into());
            }
            self.frames_written += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<(), String> {
            self.closed = true;
            Ok(())
        }
    }

    fn config() -> RecorderConfig {
        RecorderConfig {
            output_dir: PathBuf::from("/tmp/aibox-clips"),
            pre_roll_seconds: 2,
            post_roll_seconds: 5,
            fps: 10,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn clip_file_name_matches_the_configured_layout() {
        let mut recorder = Recorder::new(config(), FakeWriter::default());
        let mut ring = PreEventRingBuffer::new(1, 1);
        let now = Utc::now();
        recorder.trigger_event(&"cam1".to_string(), "intrusion", 0.9, &mut ring, now);
        let path = recorder.active.as_ref().unwrap().path.clone();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("cam1_intrusion_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn pre_roll_frames_are_written_in_fifo_order() {
        let mut recorder = Recorder::new(config(), FakeWriter::default());
        let mut ring = PreEventRingBuffer::new(1, 3);
        ring.push(RingBufferEntry {
            frame: frame("cam1", 1),
            detections: vec![],
            local_ids: vec![],
            labels: vec![],
            capture_time: Utc::now(),
        });
        ring.push(RingBufferEntry {
            frame: frame("cam1", 2),
            detections: vec![],
            local_ids: vec![],
            labels: vec![],
            capture_time: Utc::now(),
        });
        recorder.trigger_event(&"cam1".to_string(), "intrusion", 0.9, &mut ring, Utc::now());
        assert_eq!(recorder.writer.frames_written, 2);
    }

    #[test]
    fn event_retrigger_extends_deadline_without_new_file() {
        let mut recorder = Recorder::new(config(), FakeWriter::default());
        let mut ring = PreEventRingBuffer::new(1, 1);
        let now = Utc::now();
        recorder.trigger_event(&"cam1".to_string(), "intrusion", 0.9, &mut ring, now);
        let first_path = recorder.active.as_ref().unwrap().path.clone();

        recorder.trigger_event(
            &"cam1".to_string(),
            "intrusion",
            0.9,
            &mut ring,
            now + chrono::Duration::seconds(2),
        );
        let second_path = recorder.active.as_ref().unwrap().path.clone();
        assert_eq!(first_path, second_path, "re-trigger must not open a new file");
    }

    #[test]
    fn manual_mode_stops_after_requested_duration() {
        let mut recorder = Recorder::new(config(), FakeWriter::default());
        let mut ring = PreEventRingBuffer::new(1, 1);
        let now = Utc::now();
        recorder.trigger_manual(&"cam1".to_string(), chrono::Duration::seconds(10), &mut ring, now);
        let sink = InMemoryEventSink::new();

        recorder.tick(&sink, now + chrono::Duration::seconds(5));
        assert!(recorder.is_recording(), "should still be recording before deadline");

        recorder.tick(&sink, now + chrono::Duration::seconds(11));
        assert!(!recorder.is_recording());
        assert_eq!(sink.recorded().len(), 1);
    }

    #[test]
    fn write_failure_stops_clip_but_keeps_bytes_written_so_far() {
        let mut writer = FakeWriter::default();
        writer.fail_writes = false;
        let mut recorder = Recorder::new(config(), writer);
        let mut ring = PreEventRingBuffer::new(1, 1);
        let now = Utc::now();
        recorder.trigger_manual(&"cam1".to_string(), chrono::Duration::seconds(10), &mut ring, now);
        recorder.write_live_frame(&frame("cam1", 1));
        recorder.writer.fail_writes = true;
        recorder.write_live_frame(&frame("cam1", 2));

        let sink = InMemoryEventSink::new();
        recorder.tick(&sink, now);
        assert!(!recorder.is_recording());
        assert_eq!(sink.recorded().len(), 1);
    }
}
