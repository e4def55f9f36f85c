//! Consumed interfaces (spec §6 "Consumed interfaces").
//!
//! These are the seams the rest of the crate is built against without
//! depending on a concrete backing store. Production wiring in `main.rs`
//! picks concrete implementations; tests use the in-memory ones here.

use std::collections::HashMap;

use crate::types::{AlarmConfig, EventRecord, Roi, VideoSource};
use parking_lot::Mutex;

/// Persistent configuration for cameras, rules/ROIs, and alarm channels.
pub trait ConfigStore: Send + Sync {
    fn get_cameras(&self) -> Vec<VideoSource>;
    fn put_camera(&self, source: VideoSource);
    fn remove_camera(&self, id: &str);

    fn get_rois(&self, camera_id: &str) -> Vec<Roi>;
    fn put_roi(&self, roi: Roi);

    fn get_alarm_configs(&self) -> Vec<AlarmConfig>;
    fn put_alarm_config(&self, config: AlarmConfig);
}

/// Durable storage for completed recordings. `insert_event` returning
/// `false` (or an implementation choosing to log-and-swallow an error) is
/// non-fatal per spec §4.8: the clip file is never deleted on persistence
/// failure.
pub trait EventSink: Send + Sync {
    fn insert_event(&self, record: EventRecord) -> bool;
}

/// In-memory `ConfigStore`, used by tests and as the default when no
/// external store is configured.
#[derive(Default)]
pub struct InMemoryConfigStore {
    inner: Mutex<InMemoryConfigInner>,
}

#[derive(Default)]
struct InMemoryConfigInner {
    cameras: HashMap<String, VideoSource>,
    rois: HashMap<String, Vec<Roi>>,
    alarms: HashMap<String, AlarmConfig>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn get_cameras(&self) -> Vec<VideoSource> {
        self.inner.lock().cameras.values().cloned().collect()
    }

    fn put_camera(&self, source: VideoSource) {
        self.inner.lock().cameras.insert(source.id.clone(), source);
    }

    fn remove_camera(&self, id: &str) {
        self.inner.lock().cameras.remove(id);
    }

    fn get_rois(&self, camera_id: &str) -> Vec<Roi> {
        self.inner
            .lock()
            .rois
            .get(camera_id)
            .cloned()
            .unwrap_or_default()
    }

    fn put_roi(&self, roi: Roi) {
        self.inner
            .lock()
            .rois
            .entry(roi.camera_id.clone())
            .or_default()
            .push(roi);
    }

    fn get_alarm_configs(&self) -> Vec<AlarmConfig> {
        self.inner.lock().alarms.values().cloned().collect()
    }

    fn put_alarm_config(&self, config: AlarmConfig) {
        self.inner.lock().alarms.insert(config.id.clone(), config);
    }
}

/// In-memory `EventSink`, used by tests and as a fallback when no database
/// is configured.
#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<EventRecord>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<EventRecord> {
        self.events.lock().clone()
    }
}

impl EventSink for InMemoryEventSink {
    fn insert_event(&self, record: EventRecord) -> bool {
        self.events.lock().push(record);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionConfig;

    fn sample_source(id: &str) -> VideoSource {
        VideoSource {
            id: id.to_string(),
            url: "rtsp://example.invalid/stream".into(),
            username: None,
            password: None,
            width: 1920,
            height: 1080,
            fps: 15,
            enabled: true,
            detect_enabled: true,
            record_enabled: false,
            detection: DetectionConfig::default(),
        }
    }

    #[test]
    fn config_store_round_trips_a_camera() {
        let store = InMemoryConfigStore::new();
        store.put_camera(sample_source("cam1"));
        assert_eq!(store.get_cameras().len(), 1);
        store.remove_camera("cam1");
        assert!(store.get_cameras().is_empty());
    }

    #[test]
    fn event_sink_records_every_insert() {
        let sink = InMemoryEventSink::new();
        assert!(sink.insert_event(EventRecord {
            camera_id: "cam1".into(),
            event_type: "intrusion".into(),
            path: "/tmp/x.mp4".into(),
            confidence: 0.9,
            metadata: HashMap::new(),
            timestamp_utc: chrono::Utc::now(),
        }));
        assert_eq!(sink.recorded().len(), 1);
    }
}
