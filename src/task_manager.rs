//! TaskManager (C13, spec §4.13).
//!
//! Owns the `cameraId -> VideoPipeline` map and the one process-wide
//! [`CrossCameraReconciler`] every pipeline shares. `add_video_source`
//! follows the reserve-release-construct-swap dance precisely: the
//! TaskManager lock is only ever held for map mutation and status
//! snapshotting, never across pipeline construction or I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::alarm::AlarmRouter;
use crate::behavior::Rule;
use crate::collaborators::EventSink;
use crate::decode::DecoderBackend;
use crate::error::{AppError, AppResult};
use crate::inference::Inferencer;
use crate::locks::{LockLevel, LockToken};
use crate::pipeline::{default_shutdown_timeout, PipelineDependencies, PipelineInitConfig, PipelineStatus, PreviewMode, VideoPipeline};
use crate::ports::PortRegistry;
use crate::reconciler::CrossCameraReconciler;
use crate::recording::recorder::{RecorderConfig, VideoWriter};
use crate::streaming::mjpeg::JpegEncoder;
use crate::streaming::rtmp::RtmpEncoder;
use crate::types::{CameraId, Roi, VideoSource};

/// Everything needed to stand up one pipeline. The config layer is
/// responsible for turning stored configuration into this; the
/// TaskManager only sequences construction.
pub struct AddVideoSourceRequest {
    pub source: VideoSource,
    pub rules: Vec<Rule>,
    pub rois: Vec<Roi>,
    pub recorder: RecorderConfig,
    pub preview: PreviewRequest,
}

pub enum PreviewRequest {
    Mjpeg { max_clients: usize, jpeg_encoder: Arc<dyn JpegEncoder> },
    Rtmp { target_url: String, encoder: Box<dyn RtmpEncoder> },
    Disabled,
}

/// Per-camera backend construction, kept behind a trait so the
/// TaskManager never needs to know about RTSP/codec/model internals
/// (spec §1 "opaque backends").
pub trait PipelineBackendFactory: Send + Sync {
    fn build_decoder(&self, source: &VideoSource) -> Box<dyn DecoderBackend>;
    fn build_video_writer(&self, source: &VideoSource) -> Box<dyn VideoWriter>;
    fn inferencer(&self) -> Inferencer;
}

enum Slot {
    Pending,
    Active(Box<VideoPipeline>),
    Removing,
}

pub struct TaskManagerDeps {
    pub alarm_router: Arc<AlarmRouter>,
    pub event_sink: Arc<dyn EventSink>,
    pub port_registry: Arc<PortRegistry>,
    pub runtime_handle: Handle,
    pub backend_factory: Arc<dyn PipelineBackendFactory>,
}

pub struct TaskManager {
    reconciler: Arc<CrossCameraReconciler>,
    pipelines: Mutex<HashMap<CameraId, Slot>>,
    deps: TaskManagerDeps,
}

impl TaskManager {
    pub fn new(reconciler: Arc<CrossCameraReconciler>, deps: TaskManagerDeps) -> Self {
        TaskManager {
            reconciler,
            pipelines: Mutex::new(HashMap::new()),
            deps,
        }
    }

    /// Reserve the slot, build the pipeline out of lock, then swap it in
    /// (or roll back on a cancellation race) per spec §4.13.
    pub async fn add_video_source(&self, request: AddVideoSourceRequest) -> AppResult<()> {
        let camera_id = request.source.id.clone();

        {
            let _lock = LockToken::acquire(LockLevel::TaskManager);
            let mut pipelines = self.pipelines.lock();
            if pipelines.contains_key(&camera_id) {
                return Err(AppError::AlreadyExists(camera_id));
            }
            pipelines.insert(camera_id.clone(), Slot::Pending);
        }

        match self.construct_and_init(&camera_id, request).await {
            Ok(pipeline) => self.swap_in_or_roll_back(camera_id, pipeline).await,
            Err(e) => {
                {
                    let _lock = LockToken::acquire(LockLevel::TaskManager);
                    self.pipelines.lock().remove(&camera_id);
                }
                self.deps.port_registry.release(&camera_id);
                Err(e)
            }
        }
    }

    async fn swap_in_or_roll_back(&self, camera_id: CameraId, pipeline: VideoPipeline) -> AppResult<()> {
        let still_pending = {
            let _lock = LockToken::acquire(LockLevel::TaskManager);
            let mut pipelines = self.pipelines.lock();
            match pipelines.get(&camera_id) {
                Some(Slot::Pending) => {
                    pipelines.insert(camera_id.clone(), Slot::Active(Box::new(pipeline)));
                    true
                }
                _ => false,
            }
        };

        if still_pending {
            info!(camera_id = %camera_id, "pipeline added");
            return Ok(());
        }

        // Rare cancellation race: the entry was removed (or never existed
        // as Pending anymore) while we were constructing out of lock. Roll
        // back what we just built rather than leaking it.
        warn!(camera_id = %camera_id, "add_video_source lost the cancellation race, rolling back");
        let mut pipeline = pipeline;
        pipeline.stop(default_shutdown_timeout()).await;
        self.deps.port_registry.release(&camera_id);
        Ok(())
    }

    async fn construct_and_init(&self, camera_id: &CameraId, request: AddVideoSourceRequest) -> AppResult<VideoPipeline> {
        let AddVideoSourceRequest { source, rules, rois, recorder, preview } = request;

        let preview_mode = match preview {
            PreviewRequest::Mjpeg { max_clients, jpeg_encoder } => {
                let port = self.deps.port_registry.allocate(camera_id)?;
                PreviewMode::Mjpeg {
                    port,
                    max_clients,
                    fps: source.fps,
                    encoder: jpeg_encoder,
                }
            }
            PreviewRequest::Rtmp { target_url, encoder } => PreviewMode::Rtmp { target_url, encoder },
            PreviewRequest::Disabled => PreviewMode::Disabled,
        };

        let decoder_backend = self.deps.backend_factory.build_decoder(&source);
        let video_writer = self.deps.backend_factory.build_video_writer(&source);
        let inferencer = self.deps.backend_factory.inferencer();

        let init = PipelineInitConfig {
            source: source.clone(),
            rules,
            rois,
            recorder,
            preview: preview_mode,
        };
        let pipeline_deps = Arc::new(PipelineDependencies {
            reconciler: self.reconciler.clone(),
            alarm_router: self.deps.alarm_router.clone(),
            event_sink: self.deps.event_sink.clone(),
            runtime_handle: self.deps.runtime_handle.clone(),
        });

        let mut pipeline = VideoPipeline::new(camera_id.clone());
        pipeline.initialize(init, decoder_backend, inferencer, video_writer, pipeline_deps).await?;
        Ok(pipeline)
    }

    /// Mark `Removing` under lock (rejecting a concurrent add for the same
    /// id), stop out of lock, then erase.
    pub async fn remove_video_source(&self, camera_id: &CameraId) -> AppResult<()> {
        let pipeline = {
            let _lock = LockToken::acquire(LockLevel::TaskManager);
            let mut pipelines = self.pipelines.lock();
            match pipelines.get_mut(camera_id) {
                None => return Err(AppError::NotFound(camera_id.clone())),
                Some(slot) => match slot {
                    Slot::Active(_) => match std::mem::replace(slot, Slot::Removing) {
                        Slot::Active(pipeline) => pipeline,
                        _ => unreachable!("just matched Active"),
                    },
                    Slot::Pending | Slot::Removing => {
                        return Err(AppError::ConfigInvalid(format!(
                            "camera '{camera_id}' is mid-transition, retry later"
                        )));
                    }
                },
            }
        };

        let mut pipeline = pipeline;
        pipeline.stop(default_shutdown_timeout()).await;
        self.deps.port_registry.release(camera_id);

        {
            let _lock = LockToken::acquire(LockLevel::TaskManager);
            self.pipelines.lock().remove(camera_id);
        }
        info!(camera_id = %camera_id, "pipeline removed");
        Ok(())
    }

    /// Snapshot of every pipeline's observable state, including slots
    /// mid-transition (spec: "running, last frame time, drop counters,
    /// streamer health, recorder busy").
    pub fn list_status(&self) -> Vec<PipelineStatus> {
        let _lock = LockToken::acquire(LockLevel::TaskManager);
        self.pipelines
            .lock()
            .iter()
            .map(|(camera_id, slot)| match slot {
                Slot::Active(pipeline) => pipeline.status(),
                Slot::Pending | Slot::Removing => PipelineStatus {
                    camera_id: camera_id.clone(),
                    ..Default::default()
                },
            })
            .collect()
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        let _lock = LockToken::acquire(LockLevel::TaskManager);
        self.pipelines.lock().keys().cloned().collect()
    }

    /// Stop every active pipeline, then drop the reconciler last (spec:
    /// "TaskManager destroys it last on shutdown").
    pub async fn shutdown(&self, timeout: Duration) {
        let slots: Vec<(CameraId, Slot)> = {
            let _lock = LockToken::acquire(LockLevel::TaskManager);
            self.pipelines.lock().drain().collect()
        };
        for (camera_id, slot) in slots {
            if let Slot::Active(mut pipeline) = slot {
                pipeline.stop(timeout).await;
            }
            self.deps.port_registry.release(&camera_id);
        }
        info!(
            active_global_tracks = self.reconciler.active_global_count(),
            "task manager shut down, reconciler dropping last"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmRouterConfig;
    use crate::collaborators::InMemoryEventSink;
    use crate::decode::DecodedPixels;
    use crate::inference::StubBackend;
    use crate::reconciler::ReconcilerConfig;
    use crate::types::{DetectionConfig, Frame};
    use crate::worker_pool::WorkerPool;
    use std::path::PathBuf;
    use std::sync::Arc as StdArc;

    struct FakeDecoder;
    impl DecoderBackend for FakeDecoder {
        fn connect(&mut self) -> Result<(), String> {
            Ok(())
        }
        fn read_frame(&mut self) -> Result<DecodedPixels, String> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(DecodedPixels { pixels: StdArc::from(vec![0u8; 12]), width: 2, height: 2 })
        }
    }

    struct FakeWriter;
    impl VideoWriter for FakeWriter {
        fn open(&mut self, _path: &PathBuf, _fps: u32, _w: u32, _h: u32) -> Result<(), String> {
            Ok(())
        }
        fn write_frame(&mut self, _frame: &Frame) -> Result<(), String> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), String> {
            Ok(())
        }
    }

    struct FakeFactory;
    impl PipelineBackendFactory for FakeFactory {
        fn build_decoder(&self, _source: &VideoSource) -> Box<dyn DecoderBackend> {
            Box::new(FakeDecoder)
        }
        fn build_video_writer(&self, _source: &VideoSource) -> Box<dyn VideoWriter> {
            Box::new(FakeWriter)
        }
        fn inferencer(&self) -> Inferencer {
            Inferencer::new(Arc::new(StubBackend::default()))
        }
    }

    fn source(id: &str) -> VideoSource {
        VideoSource {
            id: id.to_string(),
            url: "rtsp://example.invalid/stream".to_string(),
            username: None,
            password: None,
            width: 2,
            height: 2,
            fps: 5,
            enabled: true,
            detect_enabled: true,
            record_enabled: false,
            detection: DetectionConfig::default(),
        }
    }

    fn request(id: &str) -> AddVideoSourceRequest {
        AddVideoSourceRequest {
            source: source(id),
            rules: Vec::new(),
            rois: Vec::new(),
            recorder: RecorderConfig {
                output_dir: std::env::temp_dir(),
                pre_roll_seconds: 1,
                post_roll_seconds: 1,
                fps: 5,
                width: 2,
                height: 2,
            },
            preview: PreviewRequest::Disabled,
        }
    }

    fn manager() -> TaskManager {
        let worker_pool = Arc::new(WorkerPool::new(2, 16));
        let alarm_router = AlarmRouter::new(worker_pool, Handle::current(), AlarmRouterConfig::default());
        TaskManager::new(
            Arc::new(CrossCameraReconciler::new(ReconcilerConfig::default())),
            TaskManagerDeps {
                alarm_router,
                event_sink: Arc::new(InMemoryEventSink::new()),
                port_registry: Arc::new(PortRegistry::new(19000, 19050)),
                runtime_handle: Handle::current(),
                backend_factory: Arc::new(FakeFactory),
            },
        )
    }

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let manager = manager();
        manager.add_video_source(request("cam1")).await.unwrap();
        assert_eq!(manager.camera_ids(), vec!["cam1".to_string()]);

        manager.remove_video_source(&"cam1".to_string()).await.unwrap();
        assert!(manager.camera_ids().is_empty());
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let manager = manager();
        manager.add_video_source(request("cam1")).await.unwrap();
        let err = manager.add_video_source(request("cam1")).await.unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[tokio::test]
    async fn removing_unknown_camera_is_not_found() {
        let manager = manager();
        let err = manager.remove_video_source(&"ghost".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn list_status_reports_every_added_camera() {
        let manager = manager();
        manager.add_video_source(request("cam1")).await.unwrap();
        manager.add_video_source(request("cam2")).await.unwrap();
        let statuses = manager.list_status();
        assert_eq!(statuses.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_every_pipeline() {
        let manager = manager();
        manager.add_video_source(request("cam1")).await.unwrap();
        manager.shutdown(Duration::from_secs(5)).await;
        assert!(manager.camera_ids().is_empty());
    }
}
