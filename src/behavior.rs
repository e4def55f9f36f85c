//! BehaviorAnalyzer (C7, spec §4.7).
//!
//! Evaluates a per-camera rule set against each processed frame's
//! detections and active ROIs, producing [`BehaviorEvent`]s. The rule set
//! is hot-replaceable (operators edit ROIs/rules without restarting the
//! pipeline) and firing is cooldown-gated per `(globalId, ruleId)` pair so
//! a lingering object doesn't spam the alarm router every frame.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::RwLock;

use crate::types::{
    BBox, BehaviorEvent, BehaviorEventType, CameraId, Detection, GlobalTrackId, Roi, TimeWindow,
};

/// One evaluable rule. Kept intentionally small: rules are ROI membership
/// tests gated by object class and an optional time window, which covers
/// the event types in [`BehaviorEventType`]. Richer rule languages are a
/// natural extension point but aren't needed by anything this crate emits.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub camera_id: CameraId,
    pub roi_id: String,
    pub event_type: BehaviorEventType,
    pub classes: Vec<String>,
    pub cooldown: chrono::Duration,
    pub min_confidence: f32,
}

#[derive(Default, Clone)]
struct RuleSet {
    rules: Vec<Rule>,
    rois: HashMap<String, Roi>,
}

/// Hot-replaceable rule/ROI set plus per-rule firing cooldown tracking.
pub struct BehaviorAnalyzer {
    active: Arc<RwLock<RuleSet>>,
    /// Last fire time keyed by `(global_id, rule_id)`.
    last_fired: RwLock<HashMap<(GlobalTrackId, String), DateTime<Utc>>>,
}

impl BehaviorAnalyzer {
    pub fn new() -> Self {
        BehaviorAnalyzer {
            active: Arc::new(RwLock::new(RuleSet::default())),
            last_fired: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically swap in a new rule set. Takes effect on the next
    /// [`Self::evaluate`] call; in-flight evaluations finish against the
    /// set they started with.
    pub fn replace_rules(&self, rules: Vec<Rule>, rois: Vec<Roi>) {
        let mut guard = self.active.write();
        guard.rules = rules;
        guard.rois = rois.into_iter().map(|r| (r.id.clone(), r)).collect();
    }

    pub fn active_rule_count(&self) -> usize {
        self.active.read().rules.len()
    }

    /// ROIs belonging to `camera_id`, for the overlay renderer and status
    /// surfaces. Order is unspecified.
    pub fn active_rois(&self, camera_id: &CameraId) -> Vec<Roi> {
        self.active
            .read()
            .rois
            .values()
            .filter(|roi| &roi.camera_id == camera_id)
            .cloned()
            .collect()
    }

    /// Evaluate every active rule for `camera_id` against this frame's
    /// detections, correlated with their already-assigned local-to-global
    /// track mapping. Detections without a resolved global id are still
    /// evaluated (cooldown is keyed on local-track-derived pseudo id 0 plus
    /// rule id, i.e. no cross-frame suppression) since ROI rules care about
    /// presence, not identity continuity.
    pub fn evaluate(
        &self,
        camera_id: &CameraId,
        detections: &[Detection],
        global_ids: &[Option<GlobalTrackId>],
        now: DateTime<Utc>,
    ) -> Vec<BehaviorEvent> {
        let ruleset = self.active.read();
        let mut events = Vec::new();

        for rule in ruleset.rules.iter().filter(|r| &r.camera_id == camera_id) {
            let Some(roi) = ruleset.rois.get(&rule.roi_id) else {
                continue;
            };
            if !time_window_active(&roi.time_window, now) {
                continue;
            }

            for (idx, detection) in detections.iter().enumerate() {
                if detection.confidence < rule.min_confidence {
                    continue;
                }
                if !rule.classes.is_empty() && !rule.classes.contains(&detection.class_label) {
                    continue;
                }
                if !bbox_center_in_polygon(&detection.bbox, &roi.polygon) {
                    continue;
                }

                let global_id = global_ids.get(idx).copied().flatten().unwrap_or(0);
                if !self.try_fire(global_id, &rule.id, rule.cooldown, now) {
                    continue;
                }

                events.push(BehaviorEvent {
                    event_type: rule.event_type,
                    rule_id: rule.id.clone(),
                    object_ref: global_ids.get(idx).copied().flatten(),
                    confidence: detection.confidence,
                    timestamp_utc: now,
                    bbox: detection.bbox,
                    metadata: HashMap::from([
                        ("roiId".to_string(), roi.id.clone()),
                        ("roiPriority".to_string(), roi.priority.to_string()),
                    ]),
                });
            }
        }

        events
    }

    /// Returns true and records the fire if `(global_id, rule_id)` is
    /// outside its cooldown window; false (and no state change) otherwise.
    fn try_fire(
        &self,
        global_id: GlobalTrackId,
        rule_id: &str,
        cooldown: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (global_id, rule_id.to_string());
        let mut fired = self.last_fired.write();
        match fired.get(&key) {
            Some(last) if now.signed_duration_since(*last) < cooldown => false,
            _ => {
                fired.insert(key, now);
                true
            }
        }
    }
}

impl Default for BehaviorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn time_window_active(window: &Option<TimeWindow>, now: DateTime<Utc>) -> bool {
    let Some(window) = window else { return true };
    let hour = now.hour() as u8;
    if window.start_hour <= window.end_hour {
        hour >= window.start_hour && hour < window.end_hour
    } else {
        // Wraps past midnight, e.g. 22 -> 6.
        hour >= window.start_hour || hour < window.end_hour
    }
}

fn bbox_center_in_polygon(bbox: &BBox, polygon: &[(i32, i32)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let cx = bbox.x + bbox.width / 2;
    let cy = bbox.y + bbox.height / 2;
    point_in_polygon(cx, cy, polygon)
}

/// Standard even-odd ray casting test.
fn point_in_polygon(x: i32, y: i32, polygon: &[(i32, i32)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > y) != (yj > y))
            && (x < (xj - xi) * (y - yi) / (yj - yi) + xi)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}
