//! VideoPipeline (C11, spec §4.11).
//!
//! One per camera. The decode thread already owned by [`FrameDecoder`]
//! covers the pull-decode role; this module spawns the other two —
//! infer-track-analyze and fan-out — connected by a bounded, drop-oldest
//! queue so a slow fan-out (recording, streaming, alarm dispatch) never
//! blocks inference.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::alarm::AlarmRouter;
use crate::behavior::{BehaviorAnalyzer, Rule};
use crate::collaborators::EventSink;
use crate::decode::{state_to_error, DecoderBackend, DecoderState, FrameDecoder};
use crate::error::{AppError, AppResult};
use crate::inference::{InferenceResult, Inferencer};
use crate::reconciler::CrossCameraReconciler;
use crate::recording::recorder::{Recorder, RecorderConfig, VideoWriter};
use crate::recording::ring_buffer::PreEventRingBuffer;
use crate::streaming::mjpeg::JpegEncoder;
use crate::streaming::rtmp::RtmpEncoder;
use crate::streaming::{render_overlay, FrameDistributor, MjpegServer, OverlayInput, RtmpStreamer, SystemInfoOverlay};
use crate::tracker::{Tracker, TrackerConfig};
use crate::types::{CameraId, DetectionConfig, FrameResult, GlobalTrackId, Roi, RingBufferEntry, VideoSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Initializing,
    Running,
    Stopping,
    Terminated,
    InitFailed,
}

/// Run-time knobs changeable via [`VideoPipeline::set_mutable_config`]
/// without re-initializing the pipeline. Anything else (URL, resolution)
/// requires destroy+recreate, which is [`crate::task_manager::TaskManager`]'s
/// job, not this module's.
#[derive(Debug, Clone)]
pub struct MutablePipelineConfig {
    pub detection_enabled: bool,
    pub detection: DetectionConfig,
}

impl Default for MutablePipelineConfig {
    fn default() -> Self {
        MutablePipelineConfig {
            detection_enabled: true,
            detection: DetectionConfig::default(),
        }
    }
}

pub enum PreviewMode {
    Mjpeg { port: u16, max_clients: usize, fps: u32, encoder: Arc<dyn JpegEncoder> },
    Rtmp { target_url: String, encoder: Box<dyn RtmpEncoder> },
    Disabled,
}

pub struct PipelineInitConfig {
    pub source: VideoSource,
    pub rules: Vec<Rule>,
    pub rois: Vec<Roi>,
    pub recorder: RecorderConfig,
    pub preview: PreviewMode,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub camera_id: CameraId,
    pub state: Option<PipelineState>,
    pub decode_drop_count: u64,
    pub fanout_drop_count: u64,
    pub active_track_count: usize,
    pub is_recording: bool,
    pub preview_client_count: Option<usize>,
}

const FANOUT_QUEUE_BOUND: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RECORDING_FLUSH_WINDOW: Duration = Duration::from_secs(5);

struct FanoutQueue {
    entries: StdMutex<VecDeque<FrameResult>>,
    not_empty: Condvar,
    dropped: AtomicU64,
}

impl FanoutQueue {
    fn new() -> Self {
        FanoutQueue {
            entries: StdMutex::new(VecDeque::with_capacity(FANOUT_QUEUE_BOUND)),
            not_empty: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, item: FrameResult) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= FANOUT_QUEUE_BOUND {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        entries.push_back(item);
        self.not_empty.notify_one();
    }

    fn pop(&self, running: &AtomicBool) -> Option<FrameResult> {
        let mut entries = self.entries.lock().unwrap();
        loop {
            if let Some(item) = entries.pop_front() {
                return Some(item);
            }
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            let (guard, timeout) = self.not_empty.wait_timeout(entries, Duration::from_millis(200)).unwrap();
            entries = guard;
            if timeout.timed_out() && !running.load(Ordering::SeqCst) && entries.is_empty() {
                return None;
            }
        }
    }
}

/// Shared, process-wide collaborators every pipeline needs. Constructed
/// once by `main`/`TaskManager` and handed to each pipeline at init time.
pub struct PipelineDependencies {
    pub reconciler: Arc<CrossCameraReconciler>,
    pub alarm_router: Arc<AlarmRouter>,
    pub event_sink: Arc<dyn EventSink>,
    pub runtime_handle: tokio::runtime::Handle,
}

pub struct VideoPipeline {
    camera_id: CameraId,
    state: StdMutex<PipelineState>,
    mutable_config: Arc<RwLock<MutablePipelineConfig>>,
    running: Arc<AtomicBool>,
    fanout_queue: Arc<FanoutQueue>,
    behavior: Arc<BehaviorAnalyzer>,
    decoder: Option<Arc<FrameDecoder>>,
    distributor: Arc<FrameDistributor>,
    mjpeg_server: Option<MjpegServer>,
    rtmp_streamer: Option<RtmpStreamer>,
    infer_handle: Option<JoinHandle<()>>,
    fanout_handle: Option<JoinHandle<()>>,
    preview_client_count: Arc<AtomicU64>,
    recording: Arc<AtomicBool>,
    active_track_count: Arc<AtomicUsize>,
}

impl VideoPipeline {
    pub fn new(camera_id: CameraId) -> Self {
        VideoPipeline {
            camera_id,
            state: StdMutex::new(PipelineState::Created),
            mutable_config: Arc::new(RwLock::new(MutablePipelineConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            fanout_queue: Arc::new(FanoutQueue::new()),
            behavior: Arc::new(BehaviorAnalyzer::new()),
            decoder: None,
            distributor: Arc::new(FrameDistributor::new(4)),
            mjpeg_server: None,
            rtmp_streamer: None,
            infer_handle: None,
            fanout_handle: None,
            preview_client_count: Arc::new(AtomicU64::new(0)),
            recording: Arc::new(AtomicBool::new(false)),
            active_track_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    pub fn set_mutable_config(&self, config: MutablePipelineConfig) {
        *self.mutable_config.write() = config;
    }

    pub fn replace_rules(&self, rules: Vec<Rule>, rois: Vec<Roi>) {
        self.behavior.replace_rules(rules, rois);
    }

    /// Open the decoder, bind the inferencer, start the preview streamer,
    /// and spawn the infer-track-analyze and fan-out worker threads.
    /// `InitFailed` on any step's failure; nothing partially started is
    /// left running.
    pub async fn initialize<D: DecoderBackend, W: VideoWriter>(
        &mut self,
        init: PipelineInitConfig,
        decoder_backend: D,
        inferencer: Inferencer,
        video_writer: W,
        deps: Arc<PipelineDependencies>,
    ) -> AppResult<()> {
        *self.state.lock().unwrap() = PipelineState::Initializing;
        self.behavior.replace_rules(init.rules, init.rois);

        let preview = match init.preview {
            PreviewMode::Mjpeg { port, max_clients, fps, encoder } => {
                match MjpegServer::start(self.camera_id.clone(), port, fps, max_clients, self.distributor.clone(), encoder).await {
                    Ok(server) => Some(Preview::Mjpeg(server)),
                    Err(e) => {
                        *self.state.lock().unwrap() = PipelineState::InitFailed;
                        return Err(AppError::ConfigInvalid(format!("failed to start MJPEG server: {e}")));
                    }
                }
            }
            PreviewMode::Rtmp { target_url, encoder } => {
                let distributor = self.distributor.clone();
                let next_frame = move || distributor.latest().map(|f| (*f).clone());
                Some(Preview::Rtmp(RtmpStreamer::start(self.camera_id.clone(), target_url, encoder, next_frame)))
            }
            PreviewMode::Disabled => None,
        };

        match preview {
            Some(Preview::Mjpeg(server)) => self.mjpeg_server = Some(server),
            Some(Preview::Rtmp(streamer)) => self.rtmp_streamer = Some(streamer),
            None => {}
        }

        let decoder = Arc::new(FrameDecoder::start(self.camera_id.clone(), decoder_backend));
        self.decoder = Some(decoder);
        self.running.store(true, Ordering::SeqCst);

        self.spawn_infer_track_analyze(inferencer, deps.reconciler.clone());
        self.spawn_fanout(init.recorder, video_writer, deps);

        *self.state.lock().unwrap() = PipelineState::Running;
        info!(camera_id = %self.camera_id, "pipeline running");
        Ok(())
    }

    fn spawn_infer_track_analyze(&mut self, inferencer: Inferencer, reconciler: Arc<CrossCameraReconciler>) {
        let camera_id = self.camera_id.clone();
        let running = self.running.clone();
        let mutable_config = self.mutable_config.clone();
        let behavior = self.behavior.clone();
        let fanout_queue = self.fanout_queue.clone();
        let decoder = self.decoder.as_ref().expect("decoder started before infer thread spawns").clone();
        let active_track_count = self.active_track_count.clone();

        let handle = std::thread::Builder::new()
            .name(format!("infer-{camera_id}"))
            .spawn(move || {
                let mut tracker = Tracker::new(camera_id.clone(), TrackerConfig::default());
                while running.load(Ordering::SeqCst) {
                    let Some(frame) = decoder.next_frame(Duration::from_millis(200)) else {
                        if let DecoderState::Lost(reason) = decoder.state() {
                            warn!(camera_id = %camera_id, reason, "decoder reported stream lost");
                            if let Some(err) = state_to_error(&camera_id, &DecoderState::Lost(reason)) {
                                debug!(camera_id = %camera_id, error = %err, "pipeline observed decoder error");
                            }
                        }
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    };

                    let now = frame.capture_time;
                    let config = mutable_config.read().clone();
                    let inference = if config.detection_enabled {
                        inferencer.detect(&frame)
                    } else {
                        InferenceResult::default()
                    };

                    let filtered: Vec<_> = inference
                        .detections
                        .into_iter()
                        .filter(|d| d.confidence >= config.detection.confidence_threshold)
                        .filter(|d| config.detection.classes.is_empty() || config.detection.classes.contains(&d.class_label))
                        .collect();

                    let outcome = tracker.update(&filtered, now);
                    let local_track_ids: Vec<_> = outcome.assignments.iter().map(|(_, id)| *id).collect();
                    active_track_count.store(tracker.active_track_count(), Ordering::SeqCst);

                    let global_track_ids: Vec<GlobalTrackId> = filtered
                        .iter()
                        .zip(local_track_ids.iter())
                        .map(|(detection, &local_id)| {
                            let embedding = detection.embedding.clone().unwrap_or_else(|| Arc::from(Vec::new()));
                            reconciler.resolve(&camera_id, local_id, &embedding, now)
                        })
                        .collect();
                    let global_opts: Vec<Option<GlobalTrackId>> = global_track_ids.iter().copied().map(Some).collect();

                    let behavior_events = behavior.evaluate(&camera_id, &filtered, &global_opts, now);
                    let active_rois = behavior.active_rois(&camera_id);

                    let result = FrameResult {
                        frame,
                        detections: filtered,
                        local_track_ids,
                        global_track_ids,
                        face_labels: inference.face_labels.into_iter().map(|l| l.label).collect(),
                        plate_labels: inference.plate_labels.into_iter().map(|l| l.label).collect(),
                        active_rois,
                        behavior_events,
                    };
                    fanout_queue.push(result);
                }
                debug!(camera_id = %camera_id, "infer-track-analyze worker exiting");
            })
            .expect("failed to spawn infer-track-analyze thread");

        self.infer_handle = Some(handle);
    }

    fn spawn_fanout<W: VideoWriter>(&mut self, recorder_config: RecorderConfig, video_writer: W, deps: Arc<PipelineDependencies>) {
        let camera_id = self.camera_id.clone();
        let running = self.running.clone();
        let fanout_queue = self.fanout_queue.clone();
        let distributor = self.distributor.clone();
        let recording_flag = self.recording.clone();

        let handle = std::thread::Builder::new()
            .name(format!("fanout-{camera_id}"))
            .spawn(move || {
                let fps = recorder_config.fps.max(1);
                let mut ring = PreEventRingBuffer::new(recorder_config.pre_roll_seconds, fps);
                let mut recorder = Recorder::new(recorder_config, video_writer);
                let mut last_frame_time: Option<chrono::DateTime<chrono::Utc>> = None;
                let mut measured_fps: f32 = 0.0;

                while let Some(result) = fanout_queue.pop(&running) {
                    let now = result.frame.capture_time;

                    if let Some(last) = last_frame_time {
                        let delta = (now - last).num_milliseconds();
                        if delta > 0 {
                            let instantaneous = 1000.0 / delta as f32;
                            measured_fps = if measured_fps == 0.0 {
                                instantaneous
                            } else {
                                measured_fps * 0.8 + instantaneous * 0.2
                            };
                        }
                    }
                    last_frame_time = Some(now);

                    let active_event_types: Vec<_> = result.behavior_events.iter().map(|e| e.event_type).collect();
                    let overlay_input = OverlayInput {
                        detections: &result.detections,
                        local_track_ids: &result.local_track_ids,
                        face_labels: &result.face_labels,
                        plate_labels: &result.plate_labels,
                        active_rois: &result.active_rois,
                        alarm_active: !result.behavior_events.is_empty(),
                        active_event_types: &active_event_types,
                        system_info: SystemInfoOverlay {
                            detection_count: result.detections.len(),
                            tracked_count: result.local_track_ids.len(),
                            recognized_count: result.face_labels.len() + result.plate_labels.len(),
                            fps: measured_fps,
                        },
                    };
                    let overlaid = render_overlay(&result.frame, &overlay_input);
                    distributor.publish(overlaid);

                    for event in &result.behavior_events {
                        recorder.trigger_event(
                            &camera_id,
                            &format!("{:?}", event.event_type),
                            event.confidence,
                            &mut ring,
                            now,
                        );
                    }
                    if recorder.is_recording() {
                        recorder.write_live_frame(&result.frame);
                    }
                    recorder.tick(deps.event_sink.as_ref(), now);
                    recording_flag.store(recorder.is_recording(), Ordering::SeqCst);

                    ring.push(RingBufferEntry {
                        frame: result.frame.clone(),
                        detections: result.detections.clone(),
                        local_ids: result.local_track_ids.clone(),
                        labels: result.face_labels.iter().chain(result.plate_labels.iter()).cloned().collect(),
                        capture_time: now,
                    });

                    if !result.behavior_events.is_empty() {
                        deps.alarm_router.trigger(&result);
                    }
                }
                recorder.force_stop(deps.event_sink.as_ref(), chrono::Utc::now());
                debug!(camera_id = %camera_id, "fan-out worker exiting");
            })
            .expect("failed to spawn fan-out thread");

        self.fanout_handle = Some(handle);
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            camera_id: self.camera_id.clone(),
            state: Some(self.state()),
            decode_drop_count: self.decoder.as_ref().map(|d| d.dropped_count()).unwrap_or(0),
            fanout_drop_count: self.fanout_queue.dropped.load(Ordering::SeqCst),
            active_track_count: self.active_track_count.load(Ordering::SeqCst),
            is_recording: self.recording.load(Ordering::SeqCst),
            preview_client_count: self
                .mjpeg_server
                .as_ref()
                .map(|s| s.active_client_count())
                .or_else(|| self.rtmp_streamer.as_ref().map(|_| 0)),
        }
    }

    /// Signal every worker to drain and exit, bounded by `timeout` (spec
    /// default 30s). Recording gets its own, shorter flush window inside
    /// that budget.
    pub async fn stop(&mut self, timeout: Duration) {
        *self.state.lock().unwrap() = PipelineState::Stopping;
        let deadline = std::time::Instant::now() + timeout;

        if let Some(decoder) = self.decoder.take() {
            decoder.stop();
        }
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.infer_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fanout_handle.take() {
            let _ = handle.join();
        }

        if let Some(mut server) = self.mjpeg_server.take() {
            server.stop().await;
        }
        if let Some(mut streamer) = self.rtmp_streamer.take() {
            streamer.stop();
        }

        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining < DEFAULT_RECORDING_FLUSH_WINDOW {
            warn!(camera_id = %self.camera_id, "shutdown timeout left little room for recording flush");
        }

        *self.state.lock().unwrap() = PipelineState::Terminated;
        info!(camera_id = %self.camera_id, "pipeline terminated");
    }
}

enum Preview {
    Mjpeg(MjpegServer),
    Rtmp(RtmpStreamer),
}

pub fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}
