//! AlarmRouter (C12, spec §4.12).
//!
//! One priority queue per process, fed by every pipeline's behavior events,
//! drained by a single processing thread that fans each alarm out to every
//! enabled channel in parallel with a per-channel deadline. Channel I/O is
//! async (`reqwest`, the embedded WebSocket server, `rumqttc`); the
//! processing thread itself is a plain OS thread blocking on a condvar, so
//! each dispatch is submitted to the [`crate::worker_pool::WorkerPool`] and
//! driven through a captured [`tokio::runtime::Handle`].

pub mod channels;
pub mod payload;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::locks::{LockLevel, LockToken};
use crate::types::{
    AlarmConfig, AlarmId, AlarmMethod, AlarmPayload, AlarmRoutingResult, DeliveryResult, FrameResult,
};
use crate::worker_pool::WorkerPool;

use channels::websocket::WebSocketAlarmServer;

#[derive(Debug, Clone)]
pub struct AlarmRouterConfig {
    pub max_queue: usize,
    pub max_history: usize,
    pub channel_timeout: Duration,
}

impl Default for AlarmRouterConfig {
    fn default() -> Self {
        AlarmRouterConfig {
            max_queue: 256,
            max_history: 100,
            channel_timeout: Duration::from_secs(10),
        }
    }
}

struct QueueEntry {
    payload: AlarmPayload,
    seq: u64,
}

struct Queue {
    entries: Vec<QueueEntry>,
    running: bool,
}

/// Priority-ordered multi-channel alarm dispatcher. One instance per
/// process (spec §9 "Global singletons").
pub struct AlarmRouter {
    config: AlarmRouterConfig,
    queue: Arc<(Mutex<Queue>, Condvar)>,
    next_seq: AtomicU64,
    next_alarm_id: AtomicU64,
    configs: RwLock<Vec<AlarmConfig>>,
    ws_servers: Mutex<std::collections::HashMap<u16, Arc<WebSocketAlarmServer>>>,
    mqtt_channel: Arc<channels::mqtt::MqttAlarmChannel>,
    worker_pool: Arc<WorkerPool>,
    runtime_handle: Handle,
    history: Mutex<VecDeque<AlarmRoutingResult>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl AlarmRouter {
    pub fn new(worker_pool: Arc<WorkerPool>, runtime_handle: Handle, config: AlarmRouterConfig) -> Arc<Self> {
        let router = Arc::new(AlarmRouter {
            config,
            queue: Arc::new((Mutex::new(Queue { entries: Vec::new(), running: true }), Condvar::new())),
            next_seq: AtomicU64::new(0),
            next_alarm_id: AtomicU64::new(1),
            configs: RwLock::new(Vec::new()),
            ws_servers: Mutex::new(std::collections::HashMap::new()),
            mqtt_channel: Arc::new(channels::mqtt::MqttAlarmChannel::new()),
            worker_pool,
            runtime_handle,
            history: Mutex::new(VecDeque::new()),
            processor: Mutex::new(None),
        });

        let worker = router.clone();
        let handle = std::thread::Builder::new()
            .name("alarm-router".to_string())
            .spawn(move || worker.run_processor())
            .expect("failed to spawn alarm router processor thread");
        *router.processor.lock() = Some(handle);

        router
    }

    pub fn set_configs(&self, configs: Vec<AlarmConfig>) {
        *self.configs.write() = configs;
    }

    /// Synthesize and enqueue one alarm per behavior event produced this
    /// frame. Returns the assigned alarm ids, in the order the events
    /// appear in `frame_result`.
    pub fn trigger(&self, frame_result: &FrameResult) -> Vec<AlarmId> {
        let camera_id = frame_result.frame.camera_id.clone();
        let mut assigned = Vec::with_capacity(frame_result.behavior_events.len());

        for event in &frame_result.behavior_events {
            let alarm_id = self.next_alarm_id.fetch_add(1, Ordering::SeqCst);
            let priority = payload::compute_priority(event.event_type, event.confidence);
            let alarm = AlarmPayload {
                alarm_id,
                event_type: event.event_type,
                camera_id: camera_id.clone(),
                rule_id: event.rule_id.clone(),
                object_id: event.object_ref.map(|g| g.to_string()).unwrap_or_default(),
                confidence: event.confidence,
                priority,
                timestamp_utc: event.timestamp_utc,
                metadata: serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string()),
                bbox: event.bbox,
                test_flag: false,
            };
            self.enqueue(alarm);
            assigned.push(alarm_id);
        }

        assigned
    }

    fn enqueue(&self, payload: AlarmPayload) {
        let _lock = LockToken::acquire(LockLevel::AlarmQueue);
        let (mutex, condvar) = &*self.queue;
        let mut queue = mutex.lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        queue.entries.push(QueueEntry { payload, seq });

        if queue.entries.len() > self.config.max_queue {
            // Evict lowest priority, tie broken by oldest (smallest seq).
            let worst = queue
                .entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.payload.priority.cmp(&b.payload.priority).then(a.seq.cmp(&b.seq))
                })
                .map(|(idx, _)| idx);
            if let Some(idx) = worst {
                let evicted = queue.entries.remove(idx);
                debug!(alarm_id = evicted.payload.alarm_id, "alarm queue overflow, evicted lowest priority entry");
            }
        }

        condvar.notify_one();
    }

    fn pop_highest_priority(&self) -> Option<AlarmPayload> {
        let (mutex, condvar) = &*self.queue;
        let mut queue = mutex.lock();
        loop {
            if let Some((idx, _)) = queue
                .entries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.payload.priority.cmp(&b.payload.priority).then(b.seq.cmp(&a.seq))
                })
            {
                return Some(queue.entries.remove(idx).payload);
            }
            if !queue.running {
                return None;
            }
            condvar.wait(&mut queue);
        }
    }

    fn run_processor(&self) {
        info!("alarm router processor started");
        while let Some(alarm) = self.pop_highest_priority() {
            let result = self.dispatch(alarm);
            let mut history = self.history.lock();
            history.push_back(result);
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
        info!("alarm router processor exiting");
    }

    fn dispatch(&self, payload: AlarmPayload) -> AlarmRoutingResult {
        let started = std::time::Instant::now();
        let enabled: Vec<AlarmConfig> = self.configs.read().iter().filter(|c| c.enabled).cloned().collect();

        let futures: Vec<_> = enabled
            .iter()
            .filter_map(|config| self.submit_channel_job(config.clone(), payload.clone()))
            .collect();

        let per_channel: Vec<DeliveryResult> = self.runtime_handle.block_on(join_all(futures)).into_iter().flatten().collect();

        let success_count = per_channel.iter().filter(|r| r.success).count();
        let fail_count = per_channel.len() - success_count;

        AlarmRoutingResult {
            alarm_id: payload.alarm_id,
            per_channel,
            success_count,
            fail_count,
            total_elapsed: started.elapsed(),
        }
    }

    fn submit_channel_job(
        &self,
        config: AlarmConfig,
        payload: AlarmPayload,
    ) -> Option<impl std::future::Future<Output = Option<DeliveryResult>>> {
        let timeout = self.config.channel_timeout;
        let runtime_handle = self.runtime_handle.clone();
        let mqtt_channel = self.mqtt_channel.clone();
        let ws_server = match config.method {
            AlarmMethod::WebSocket => {
                let port = config.websocket.as_ref().map(|c| c.port).unwrap_or(8081);
                Some(self.get_or_start_ws_server(port))
            }
            _ => None,
        };

        let job = move || -> DeliveryResult {
            runtime_handle.block_on(async move {
                let outcome = tokio::time::timeout(timeout, dispatch_single(&config, &payload, ws_server.as_deref(), &mqtt_channel)).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => DeliveryResult {
                        config_id: config.id.clone(),
                        method: config.method,
                        success: false,
                        elapsed: timeout,
                        error: Some("channel dispatch exceeded deadline".to_string()),
                    },
                }
            })
        };

        match self.worker_pool.submit(job) {
            Ok(fut) => Some(fut),
            Err(e) => {
                warn!(config_id = %config.id, error = %e, "failed to submit alarm delivery job");
                None
            }
        }
    }

    fn get_or_start_ws_server(&self, port: u16) -> Arc<WebSocketAlarmServer> {
        let mut servers = self.ws_servers.lock();
        if let Some(existing) = servers.get(&port) {
            return existing.clone();
        }
        let server = self
            .runtime_handle
            .block_on(WebSocketAlarmServer::start(port))
            .expect("failed to start alarm websocket server");
        let server = Arc::new(server);
        servers.insert(port, server.clone());
        server
    }

    pub fn recent_results(&self) -> Vec<AlarmRoutingResult> {
        self.history.lock().iter().cloned().collect()
    }

    /// Rolling average latency and success rate per channel method, over
    /// the retained `MAX_HISTORY` results.
    pub fn channel_stats(&self) -> Vec<(AlarmMethod, ChannelStats)> {
        let history = self.history.lock();
        let mut by_method: std::collections::HashMap<AlarmMethod, (u32, u32, Duration)> = std::collections::HashMap::new();
        for result in history.iter() {
            for delivery in &result.per_channel {
                let entry = by_method.entry(delivery.method).or_insert((0, 0, Duration::ZERO));
                entry.0 += 1;
                if delivery.success {
                    entry.1 += 1;
                }
                entry.2 += delivery.elapsed;
            }
        }
        by_method
            .into_iter()
            .map(|(method, (total, successes, total_latency))| {
                let stats = ChannelStats {
                    total_deliveries: total as usize,
                    success_rate: if total == 0 { 0.0 } else { successes as f64 / total as f64 },
                    average_latency: if total == 0 { Duration::ZERO } else { total_latency / total },
                };
                (method, stats)
            })
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.0.lock().entries.len()
    }

    pub fn shutdown(&self) {
        {
            let mut queue = self.queue.0.lock();
            queue.running = false;
        }
        self.queue.1.notify_all();
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub total_deliveries: usize,
    pub success_rate: f64,
    pub average_latency: Duration,
}

async fn dispatch_single(
    config: &AlarmConfig,
    payload: &AlarmPayload,
    ws_server: Option<&WebSocketAlarmServer>,
    mqtt_channel: &channels::mqtt::MqttAlarmChannel,
) -> DeliveryResult {
    match config.method {
        AlarmMethod::Http => match &config.http {
            Some(http_config) => channels::http::deliver(&config.id, http_config, payload).await,
            None => missing_config(config, "http config missing for HTTP alarm channel"),
        },
        AlarmMethod::WebSocket => match ws_server {
            Some(server) => channels::websocket::deliver(&config.id, server, payload),
            None => missing_config(config, "websocket server unavailable"),
        },
        AlarmMethod::Mqtt => match &config.mqtt {
            Some(mqtt_config) => channels::mqtt::deliver(&config.id, mqtt_channel, mqtt_config, payload).await,
            None => missing_config(config, "mqtt config missing for MQTT alarm channel"),
        },
    }
}

fn missing_config(config: &AlarmConfig, reason: &str) -> DeliveryResult {
    DeliveryResult {
        config_id: config.id.clone(),
        method: config.method,
        success: false,
        elapsed: Duration::ZERO,
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, BehaviorEvent, BehaviorEventType, Frame};

    fn frame_result(event_type: BehaviorEventType, confidence: f32) -> FrameResult {
        FrameResult {
            frame: Frame {
                pixels: Arc::from(vec![0u8; 3]),
                width: 1,
                height: 1,
                capture_time: Utc::now(),
                sequence_number: 0,
                camera_id: "cam1".to_string(),
            },
            detections: Vec::new(),
            local_track_ids: Vec::new(),
            global_track_ids: Vec::new(),
            face_labels: Vec::new(),
            plate_labels: Vec::new(),
            active_rois: Vec::new(),
            behavior_events: vec![BehaviorEvent {
                event_type,
                rule_id: "rule1".to_string(),
                object_ref: Some(1),
                confidence,
                timestamp_utc: Utc::now(),
                bbox: BBox { x: 0, y: 0, width: 1, height: 1 },
                metadata: Default::default(),
            }],
        }
    }

    #[tokio::test]
    async fn max_queue_overflow_evicts_lowest_priority_tie_oldest() {
        let (mutex, condvar) = (Mutex::new(Queue { entries: Vec::new(), running: true }), Condvar::new());
        let queue = Arc::new((mutex, condvar));
        let router = AlarmRouter {
            config: AlarmRouterConfig { max_queue: 2, max_history: 10, channel_timeout: Duration::from_secs(1) },
            queue,
            next_seq: AtomicU64::new(0),
            next_alarm_id: AtomicU64::new(1),
            configs: RwLock::new(Vec::new()),
            ws_servers: Mutex::new(std::collections::HashMap::new()),
            mqtt_channel: Arc::new(channels::mqtt::MqttAlarmChannel::new()),
            worker_pool: Arc::new(WorkerPool::new(1, 8)),
            runtime_handle: tokio::runtime::Handle::current(),
            history: Mutex::new(VecDeque::new()),
            processor: Mutex::new(None),
        };

        let make = |priority: u8, id: u64| AlarmPayload {
            alarm_id: id,
            event_type: BehaviorEventType::Other,
            camera_id: "cam1".to_string(),
            rule_id: "r".to_string(),
            object_id: "1".to_string(),
            confidence: 0.5,
            priority,
            timestamp_utc: Utc::now(),
            metadata: "{}".to_string(),
            bbox: BBox { x: 0, y: 0, width: 1, height: 1 },
            test_flag: false,
        };

        router.enqueue(make(5, 1));
        router.enqueue(make(5, 2));
        assert_eq!(router.queue_len(), 2);
        // A third, lower-priority entry should be evicted immediately.
        router.enqueue(make(1, 3));
        assert_eq!(router.queue_len(), 2);
        let remaining: Vec<u8> = router.queue.0.lock().entries.iter().map(|e| e.payload.priority).collect();
        assert!(remaining.iter().all(|p| *p == 5));
    }

    #[tokio::test]
    async fn trigger_assigns_monotonic_alarm_ids() {
        let router = AlarmRouter {
            config: AlarmRouterConfig::default(),
            queue: Arc::new((Mutex::new(Queue { entries: Vec::new(), running: true }), Condvar::new())),
            next_seq: AtomicU64::new(0),
            next_alarm_id: AtomicU64::new(1),
            configs: RwLock::new(Vec::new()),
            ws_servers: Mutex::new(std::collections::HashMap::new()),
            mqtt_channel: Arc::new(channels::mqtt::MqttAlarmChannel::new()),
            worker_pool: Arc::new(WorkerPool::new(1, 8)),
            runtime_handle: tokio::runtime::Handle::current(),
            history: Mutex::new(VecDeque::new()),
            processor: Mutex::new(None),
        };

        let ids1 = router.trigger(&frame_result(BehaviorEventType::Intrusion, 0.95));
        let ids2 = router.trigger(&frame_result(BehaviorEventType::Other, 0.3));
        assert!(ids2[0] > ids1[0]);
        assert_eq!(router.queue_len(), 2);
    }
}
