//! MQTT alarm channel (spec §4.12 "MQTT").

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::alarm::payload::to_wire_json;
use crate::types::{AlarmMethod, AlarmPayload, DeliveryResult, MqttAlarmConfig};

struct Cached {
    host: String,
    port: u16,
    client: AsyncClient,
    poller: JoinHandle<()>,
}

/// Publishes to a configured broker, reconnecting automatically whenever
/// the broker/port changes or the cached connection was dropped.
pub struct MqttAlarmChannel {
    cached: Mutex<Option<Cached>>,
}

impl MqttAlarmChannel {
    pub fn new() -> Self {
        MqttAlarmChannel {
            cached: Mutex::new(None),
        }
    }

    fn ensure_connected(&self, config: &MqttAlarmConfig) -> AsyncClient {
        let mut guard = self.cached.lock();
        let needs_reconnect = match &*guard {
            Some(cached) => cached.host != config.broker_host || cached.port != config.broker_port,
            None => true,
        };

        if needs_reconnect {
            if let Some(old) = guard.take() {
                old.poller.abort();
            }
            let mut options = MqttOptions::new(
                format!("aibox-alarm-{}", uuid_like()),
                config.broker_host.clone(),
                config.broker_port,
            );
            options.set_keep_alive(Duration::from_secs(10));
            let (client, mut eventloop) = AsyncClient::new(options, 32);

            let poller = tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => debug!("mqtt connected"),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "mqtt eventloop error");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            });

            *guard = Some(Cached {
                host: config.broker_host.clone(),
                port: config.broker_port,
                client: client.clone(),
                poller,
            });
        }

        guard.as_ref().unwrap().client.clone()
    }
}

impl Default for MqttAlarmChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn uuid_like() -> u64 {
    // Stable per-process suffix so repeated reconnects from this process
    // don't collide with a previous client id still registered on the
    // broker; not a real UUID since this crate avoids an extra dependency
    // for it.
    std::process::id() as u64
}

pub async fn deliver(config_id: &str, channel: &MqttAlarmChannel, config: &MqttAlarmConfig, payload: &AlarmPayload) -> DeliveryResult {
    let started = Instant::now();
    let json = match to_wire_json(payload) {
        Ok(j) => j,
        Err(e) => {
            return DeliveryResult {
                config_id: config_id.to_string(),
                method: AlarmMethod::Mqtt,
                success: false,
                elapsed: started.elapsed(),
                error: Some(format!("failed to serialize payload: {e}")),
            }
        }
    };

    let client = channel.ensure_connected(config);
    let qos = match config.qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    };

    match client.publish(&config.topic, qos, config.retain, json).await {
        Ok(()) => DeliveryResult {
            config_id: config_id.to_string(),
            method: AlarmMethod::Mqtt,
            success: true,
            elapsed: started.elapsed(),
            error: None,
        },
        Err(e) => DeliveryResult {
            config_id: config_id.to_string(),
            method: AlarmMethod::Mqtt,
            success: false,
            elapsed: started.elapsed(),
            error: Some(e.to_string()),
        },
    }
}
