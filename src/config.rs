//! On-disk configuration (spec §6 "Configuration").
//!
//! Mirrors the in-memory types in [`crate::types`], [`crate::behavior`] and
//! [`crate::reconciler`] as closely as serde allows. A few in-memory types
//! carry a `chrono::Duration` field, which isn't `Serialize`/`Deserialize`;
//! those get a small proxy struct here (`RuleConfig`, `ReconcilerSectionConfig`)
//! that converts to/from the real type on load.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::UdpSocket;
use std::path::Path;

use crate::alarm::AlarmRouterConfig;
use crate::behavior::Rule;
use crate::reconciler::ReconcilerConfig;
use crate::recording::recorder::RecorderConfig;
use crate::types::{AlarmConfig, CameraId, Roi, VideoSource};

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub cameras: Vec<VideoSource>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub rois: Vec<Roi>,
    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
    pub recording: RecorderConfig,
    #[serde(default)]
    pub preview: Vec<PreviewEntryConfig>,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub alarm_router: AlarmRouterSectionConfig,
    #[serde(default)]
    pub reconciler: ReconcilerSectionConfig,
}

/// HTTP admin server + pipeline-wide port allocation bounds (spec §4.13,
/// §4.11 "PreviewPort range").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_preview_port_start")]
    pub preview_port_range_start: u16,

    #[serde(default = "default_preview_port_end")]
    pub preview_port_range_end: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

fn default_admin_port() -> u16 {
    8080
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_preview_port_start() -> u16 {
    19000
}
fn default_preview_port_end() -> u16 {
    19099
}

/// Serializable proxy for [`Rule`]; `cooldown_seconds` becomes
/// `chrono::Duration` on conversion since `chrono::Duration` has no serde
/// support of its own.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuleConfig {
    pub id: String,
    pub camera_id: CameraId,
    pub roi_id: String,
    pub event_type: crate::types::BehaviorEventType,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_cooldown_seconds() -> i64 {
    30
}
fn default_min_confidence() -> f32 {
    0.5
}

impl From<RuleConfig> for Rule {
    fn from(c: RuleConfig) -> Self {
        Rule {
            id: c.id,
            camera_id: c.camera_id,
            roi_id: c.roi_id,
            event_type: c.event_type,
            classes: c.classes,
            cooldown: chrono::Duration::seconds(c.cooldown_seconds),
            min_confidence: c.min_confidence,
        }
    }
}

/// One camera's preview-stream selection (spec §4.11 "PreviewMode").
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreviewEntryConfig {
    pub camera_id: CameraId,
    pub mode: PreviewModeKind,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub rtmp_target_url: Option<String>,
}

fn default_max_clients() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreviewModeKind {
    Disabled,
    Mjpeg,
    Rtmp,
}

/// Mirrors [`crate::worker_pool::WorkerPool::new`]'s two knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerPoolConfig {
    #[serde(default = "default_worker_pool_size")]
    pub size: usize,
    #[serde(default = "default_saturation_threshold")]
    pub saturation_threshold: usize,
}

fn default_worker_pool_size() -> usize {
    8
}
fn default_saturation_threshold() -> usize {
    256
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            size: default_worker_pool_size(),
            saturation_threshold: default_saturation_threshold(),
        }
    }
}

/// Mirrors [`AlarmRouterConfig`]; `channel_timeout_ms` becomes
/// `std::time::Duration` on conversion.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AlarmRouterSectionConfig {
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_channel_timeout_ms")]
    pub channel_timeout_ms: u64,
}

fn default_max_queue() -> usize {
    256
}
fn default_max_history() -> usize {
    100
}
fn default_channel_timeout_ms() -> u64 {
    10_000
}

impl Default for AlarmRouterSectionConfig {
    fn default() -> Self {
        AlarmRouterSectionConfig {
            max_queue: default_max_queue(),
            max_history: default_max_history(),
            channel_timeout_ms: default_channel_timeout_ms(),
        }
    }
}

impl From<AlarmRouterSectionConfig> for AlarmRouterConfig {
    fn from(c: AlarmRouterSectionConfig) -> Self {
        AlarmRouterConfig {
            max_queue: c.max_queue,
            max_history: c.max_history,
            channel_timeout: std::time::Duration::from_millis(c.channel_timeout_ms),
        }
    }
}

/// Serializable proxy for [`ReconcilerConfig`]; the two `chrono::Duration`
/// fields travel as whole seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReconcilerSectionConfig {
    #[serde(default = "default_tau_high")]
    pub tau_high: f32,
    #[serde(default = "default_tau_low")]
    pub tau_low: f32,
    #[serde(default = "default_max_temporal_gap_seconds")]
    pub max_temporal_gap_seconds: i64,
    #[serde(default)]
    pub forbidden_pairs: Vec<(CameraId, CameraId)>,
    #[serde(default = "default_global_ttl_seconds")]
    pub global_ttl_seconds: i64,
}

fn default_tau_high() -> f32 {
    0.8
}
fn default_tau_low() -> f32 {
    0.6
}
fn default_max_temporal_gap_seconds() -> i64 {
    5
}
fn default_global_ttl_seconds() -> i64 {
    60
}

impl Default for ReconcilerSectionConfig {
    fn default() -> Self {
        ReconcilerSectionConfig {
            tau_high: default_tau_high(),
            tau_low: default_tau_low(),
            max_temporal_gap_seconds: default_max_temporal_gap_seconds(),
            forbidden_pairs: Vec::new(),
            global_ttl_seconds: default_global_ttl_seconds(),
        }
    }
}

impl From<ReconcilerSectionConfig> for ReconcilerConfig {
    fn from(c: ReconcilerSectionConfig) -> Self {
        ReconcilerConfig {
            tau_high: c.tau_high,
            tau_low: c.tau_low,
            max_temporal_gap: chrono::Duration::seconds(c.max_temporal_gap_seconds),
            forbidden_pairs: c.forbidden_pairs,
            global_ttl: chrono::Duration::seconds(c.global_ttl_seconds),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, auto-detecting `host_ip` if unset.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let mut config: Config = toml::from_str(&content).context("failed to parse config file")?;

        if config.server.host_ip.is_none() {
            config.server.host_ip = Some(get_local_ip().unwrap_or_else(|| "localhost".to_string()));
        }

        Ok(config)
    }

    /// A minimal single-camera default, mainly useful for smoke tests and
    /// `--print-default-config`.
    pub fn default() -> Self {
        Config {
            server: ServerConfig {
                admin_port: default_admin_port(),
                bind_ip: default_bind_ip(),
                preview_port_range_start: default_preview_port_start(),
                preview_port_range_end: default_preview_port_end(),
                host_ip: Some(get_local_ip().unwrap_or_else(|| "localhost".to_string())),
            },
            cameras: Vec::new(),
            rules: Vec::new(),
            rois: Vec::new(),
            alarms: Vec::new(),
            recording: RecorderConfig {
                output_dir: std::path::PathBuf::from("./recordings"),
                pre_roll_seconds: 5,
                post_roll_seconds: 10,
                fps: 15,
                width: 1920,
                height: 1080,
            },
            preview: Vec::new(),
            worker_pool: WorkerPoolConfig::default(),
            alarm_router: AlarmRouterSectionConfig::default(),
            reconciler: ReconcilerSectionConfig::default(),
        }
    }

    /// The configured or auto-detected host IP, re-detecting if `from_file`
    /// was bypassed (e.g. in tests building a `Config` directly).
    pub fn host_ip(&self) -> String {
        self.server
            .host_ip
            .clone()
            .unwrap_or_else(|| get_local_ip().unwrap_or_else(|| "localhost".to_string()))
    }
}

fn get_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let local_addr = socket.local_addr().ok()?;
    Some(local_addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_admin_port() {
        let config = Config::default();
        assert_eq!(config.server.admin_port, 8080);
        assert_eq!(config.worker_pool.size, 8);
    }

    #[test]
    fn rule_config_converts_seconds_to_duration() {
        let rc = RuleConfig {
            id: "r1".into(),
            camera_id: "cam1".into(),
            roi_id: "roi1".into(),
            event_type: crate::types::BehaviorEventType::Intrusion,
            classes: vec!["person".into()],
            cooldown_seconds: 45,
            min_confidence: 0.6,
        };
        let rule: Rule = rc.into();
        assert_eq!(rule.cooldown, chrono::Duration::seconds(45));
    }

    #[test]
    fn reconciler_section_converts_to_reconciler_config() {
        let section = ReconcilerSectionConfig::default();
        let config: ReconcilerConfig = section.into();
        assert_eq!(config.max_temporal_gap, chrono::Duration::seconds(5));
        assert_eq!(config.global_ttl, chrono::Duration::seconds(60));
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [server]
            admin-port = 9090

            [recording]
            output-dir = "/var/recordings"
            fps = 15
            width = 1920
            height = 1080
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.admin_port, 9090);
        assert_eq!(config.recording.pre_roll_seconds, 5);
    }
}
