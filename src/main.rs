use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aibox_core::alarm::{AlarmRouter, AlarmRouterConfig};
use aibox_core::collaborators::InMemoryEventSink;
use aibox_core::config::Config;
use aibox_core::decode::{DecodedPixels, DecoderBackend};
use aibox_core::inference::{Capability, Inferencer, StubBackend};
use aibox_core::locks::abort_fatal;
use aibox_core::ports::PortRegistry;
use aibox_core::reconciler::CrossCameraReconciler;
use aibox_core::recording::recorder::VideoWriter;
use aibox_core::streaming::mjpeg::JpegEncoder;
use aibox_core::streaming::rtmp::RtmpEncoder;
use aibox_core::task_manager::{AddVideoSourceRequest, PipelineBackendFactory, PreviewRequest, TaskManager, TaskManagerDeps};
use aibox_core::types::{Frame, VideoSource};
use aibox_core::worker_pool::WorkerPool;

#[derive(Parser, Debug)]
#[command(name = "aibox", about = "Multi-camera AI video analytics appliance")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    if cli.print_default_config {
        println!("{}", toml::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    let config = Config::from_file(&cli.config).context("loading configuration")?;
    tracing::info!(host_ip = %config.host_ip(), "starting aibox-core");

    // Process-wide singletons (spec §9 "Global singletons"): constructed once,
    // shared by every pipeline TaskManager creates.
    let port_registry = Arc::new(PortRegistry::new(
        config.server.preview_port_range_start,
        config.server.preview_port_range_end,
    ));
    let worker_pool = Arc::new(WorkerPool::new(config.worker_pool.size, config.worker_pool.saturation_threshold));
    let alarm_router = AlarmRouter::new(
        worker_pool.clone(),
        tokio::runtime::Handle::current(),
        config.alarm_router.clone().into(),
    );
    alarm_router.set_configs(config.alarms.clone());
    let event_sink: Arc<dyn aibox_core::collaborators::EventSink> = Arc::new(InMemoryEventSink::new());
    let reconciler = Arc::new(CrossCameraReconciler::new(config.reconciler.clone().into()));

    let backend_factory: Arc<dyn PipelineBackendFactory> = Arc::new(OpaqueBackendFactory);

    let task_manager = Arc::new(TaskManager::new(
        reconciler,
        TaskManagerDeps {
            alarm_router: alarm_router.clone(),
            event_sink,
            port_registry,
            runtime_handle: tokio::runtime::Handle::current(),
            backend_factory,
        },
    ));

    for camera in &config.cameras {
        if !camera.enabled {
            continue;
        }
        if let Err(e) = add_camera(&task_manager, &config, camera.clone()).await {
            tracing::error!(camera_id = %camera.id, error = %e, "failed to add camera at startup");
        }
    }

    let admin_task_manager = task_manager.clone();
    let admin = tokio::spawn(aibox_core::admin::run_server(
        config.server.bind_ip.clone(),
        config.server.admin_port,
        admin_task_manager,
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::warn!(error = %e, "failed to listen for shutdown signal"),
    }

    task_manager.shutdown(aibox_core::pipeline::default_shutdown_timeout()).await;
    admin.abort();

    Ok(())
}

async fn add_camera(task_manager: &Arc<TaskManager>, config: &Config, source: VideoSource) -> Result<()> {
    let rules = config
        .rules
        .iter()
        .filter(|r| r.camera_id == source.id)
        .cloned()
        .map(Into::into)
        .collect();
    let rois = config.rois.iter().filter(|r| r.camera_id == source.id).cloned().collect();
    let preview = config
        .preview
        .iter()
        .find(|p| p.camera_id == source.id)
        .map(|p| match p.mode {
            aibox_core::config::PreviewModeKind::Disabled => PreviewRequest::Disabled,
            aibox_core::config::PreviewModeKind::Mjpeg => PreviewRequest::Mjpeg {
                max_clients: p.max_clients,
                jpeg_encoder: Arc::new(OpaqueJpegEncoder) as Arc<dyn JpegEncoder>,
            },
            aibox_core::config::PreviewModeKind::Rtmp => PreviewRequest::Rtmp {
                target_url: p.rtmp_target_url.clone().unwrap_or_default(),
                encoder: Box::new(OpaqueRtmpEncoder),
            },
        })
        .unwrap_or(PreviewRequest::Disabled);

    task_manager
        .add_video_source(AddVideoSourceRequest {
            source,
            rules,
            rois,
            recorder: config.recording.clone(),
            preview,
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.reason_line()))
}

/// Concrete backend construction for [`TaskManager`]. Wire codecs and model
/// weights are opaque per spec §1; these placeholders are the seam a real
/// deployment swaps in a decode/encode/inference library behind.
struct OpaqueBackendFactory;

impl PipelineBackendFactory for OpaqueBackendFactory {
    fn build_decoder(&self, source: &VideoSource) -> Box<dyn DecoderBackend> {
        Box::new(OpaqueDecoderBackend {
            width: source.width,
            height: source.height,
        })
    }

    fn build_video_writer(&self, _source: &VideoSource) -> Box<dyn VideoWriter> {
        Box::new(OpaqueVideoWriter)
    }

    fn inferencer(&self) -> Inferencer {
        let mut capabilities = HashSet::new();
        capabilities.insert(Capability::Detect);
        capabilities.insert(Capability::Embed);
        Inferencer::new(Arc::new(StubBackend {
            capabilities,
            ..StubBackend::default()
        }))
    }
}

struct OpaqueDecoderBackend {
    width: u32,
    height: u32,
}

impl DecoderBackend for OpaqueDecoderBackend {
    fn connect(&mut self) -> Result<(), String> {
        Err("no RTSP/codec backend is wired in; replace OpaqueDecoderBackend with a real decode library".to_string())
    }

    fn read_frame(&mut self) -> Result<DecodedPixels, String> {
        Ok(DecodedPixels {
            pixels: Arc::from(vec![0u8; (self.width * self.height * 3) as usize]),
            width: self.width,
            height: self.height,
        })
    }
}

struct OpaqueVideoWriter;

impl VideoWriter for OpaqueVideoWriter {
    fn open(&mut self, _path: &std::path::PathBuf, _fps: u32, _width: u32, _height: u32) -> Result<(), String> {
        Ok(())
    }

    fn write_frame(&mut self, _frame: &Frame) -> Result<(), String> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        Ok(())
    }
}

struct OpaqueJpegEncoder;

impl JpegEncoder for OpaqueJpegEncoder {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, String> {
        Ok(frame.pixels.to_vec())
    }
}

struct OpaqueRtmpEncoder;

impl RtmpEncoder for OpaqueRtmpEncoder {
    fn connect(&mut self, target_url: &str) -> Result<(), String> {
        Err(format!("no RTMP/FLV backend is wired in; cannot connect to {target_url}"))
    }

    fn write_frame(&mut self, _frame: &Frame, _pts_ms: u64) -> Result<(), String> {
        Ok(())
    }
}

#[allow(dead_code)]
fn fatal_on_invariant_violation(err: &aibox_core::error::AppError) -> ! {
    abort_fatal(err)
}
