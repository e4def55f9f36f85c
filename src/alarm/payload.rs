//! Alarm priority computation and the exact wire JSON shape (spec §6, §4.12).

use serde::Serialize;

use crate::types::{AlarmPayload, BBox, BehaviorEventType};

/// `(eventType, confidence)` -> priority 1..5 per spec §4.12's table and
/// adjustment rule.
pub fn compute_priority(event_type: BehaviorEventType, confidence: f32) -> u8 {
    let base = event_type.base_priority() as i32;
    let adjusted = if confidence >= 0.9 {
        base + 1
    } else if confidence < 0.5 {
        base - 1
    } else {
        base
    };
    adjusted.clamp(1, 5) as u8
}

#[derive(Debug, Serialize)]
struct WireBBox {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
}

impl From<BBox> for WireBBox {
    fn from(b: BBox) -> Self {
        WireBBox {
            x: b.x,
            y: b.y,
            width: b.width,
            height: b.height,
        }
    }
}

/// The exact on-the-wire JSON shape delivered to HTTP, WebSocket, and MQTT
/// channels alike.
#[derive(Debug, Serialize)]
pub struct WireAlarmMessage {
    alarm_id: String,
    event_type: String,
    camera_id: String,
    rule_id: String,
    object_id: String,
    confidence: f64,
    priority: u8,
    timestamp: String,
    metadata: String,
    bounding_box: WireBBox,
    test_mode: bool,
}

fn event_type_wire_name(event_type: BehaviorEventType) -> &'static str {
    match event_type {
        BehaviorEventType::Intrusion => "intrusion",
        BehaviorEventType::UnauthorizedAccess => "unauthorized_access",
        BehaviorEventType::MotionDetected => "motion_detected",
        BehaviorEventType::ObjectDetected => "object_detected",
        BehaviorEventType::Loitering => "loitering",
        BehaviorEventType::AbandonedObject => "abandoned_object",
        BehaviorEventType::Other => "other",
    }
}

impl From<&AlarmPayload> for WireAlarmMessage {
    fn from(p: &AlarmPayload) -> Self {
        WireAlarmMessage {
            alarm_id: p.alarm_id.to_string(),
            event_type: event_type_wire_name(p.event_type).to_string(),
            camera_id: p.camera_id.clone(),
            rule_id: p.rule_id.clone(),
            object_id: p.object_id.clone(),
            // Truncate to 3 decimal places per spec.
            confidence: (p.confidence as f64 * 1000.0).round() / 1000.0,
            priority: p.priority,
            timestamp: p.timestamp_utc.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            metadata: p.metadata.clone(),
            bounding_box: p.bbox.into(),
            test_mode: p.test_flag,
        }
    }
}

pub fn to_wire_json(payload: &AlarmPayload) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireAlarmMessage::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_table_adjustment_high_confidence_caps_at_five() {
        assert_eq!(compute_priority(BehaviorEventType::Intrusion, 0.95), 5);
    }

    #[test]
    fn priority_table_adjustment_low_confidence_floors_at_one() {
        assert_eq!(compute_priority(BehaviorEventType::Other, 0.3), 1);
    }

    #[test]
    fn priority_adjustment_examples_from_spec() {
        assert_eq!(compute_priority(BehaviorEventType::Intrusion, 0.95), 5);
        assert_eq!(compute_priority(BehaviorEventType::Other, 0.3), 1);
    }

    #[test]
    fn mid_confidence_gets_no_adjustment() {
        assert_eq!(compute_priority(BehaviorEventType::Loitering, 0.7), 2);
    }

    #[test]
    fn wire_json_matches_documented_shape() {
        let payload = AlarmPayload {
            alarm_id: 42,
            event_type: BehaviorEventType::Intrusion,
            camera_id: "cam1".into(),
            rule_id: "r1".into(),
            object_id: "17".into(),
            confidence: 0.91234,
            priority: 5,
            timestamp_utc: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00.500Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            metadata: "{}".into(),
            bbox: BBox { x: 1, y: 2, width: 3, height: 4 },
            test_flag: false,
        };
        let json = to_wire_json(&payload).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["alarm_id"], "42");
        assert_eq!(value["event_type"], "intrusion");
        assert_eq!(value["confidence"], 0.912);
        assert_eq!(value["timestamp"], "2026-01-01T00:00:00.500Z");
        assert_eq!(value["bounding_box"]["width"], 3);
        assert_eq!(value["test_mode"], false);
    }
}
