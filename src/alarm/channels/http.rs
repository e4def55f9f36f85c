//! HTTP alarm channel (spec §4.12 "HTTP").

use std::time::{Duration, Instant};

use tracing::warn;

use crate::alarm::payload::to_wire_json;
use crate::types::{AlarmPayload, DeliveryResult, HttpAlarmConfig};

pub async fn deliver(config_id: &str, config: &HttpAlarmConfig, payload: &AlarmPayload) -> DeliveryResult {
    let started = Instant::now();
    let body = match to_wire_json(payload) {
        Ok(json) => json,
        Err(e) => {
            return DeliveryResult {
                config_id: config_id.to_string(),
                method: crate::types::AlarmMethod::Http,
                success: false,
                elapsed: started.elapsed(),
                error: Some(format!("failed to serialize payload: {e}")),
            }
        }
    };

    let client = reqwest::Client::new();
    let mut request = client
        .post(&config.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", concat!(env!("CARGO_PKG_NAME"), "/1.0"))
        .body(body);
    for (key, value) in &config.headers {
        request = request.header(key, value);
    }

    let timeout = Duration::from_millis(config.timeout_ms);
    let outcome = tokio::time::timeout(timeout, request.send()).await;

    match outcome {
        Ok(Ok(response)) => {
            let status = response.status();
            let success = (200..300).contains(&status.as_u16());
            if !success {
                warn!(config_id, status = %status, "alarm HTTP delivery returned non-2xx");
            }
            DeliveryResult {
                config_id: config_id.to_string(),
                method: crate::types::AlarmMethod::Http,
                success,
                elapsed: started.elapsed(),
                error: if success { None } else { Some(format!("status {status}")) },
            }
        }
        Ok(Err(e)) => DeliveryResult {
            config_id: config_id.to_string(),
            method: crate::types::AlarmMethod::Http,
            success: false,
            elapsed: started.elapsed(),
            error: Some(e.to_string()),
        },
        Err(_) => DeliveryResult {
            config_id: config_id.to_string(),
            method: crate::types::AlarmMethod::Http,
            success: false,
            elapsed: started.elapsed(),
            error: Some("failure:timeout".to_string()),
        },
    }
}
