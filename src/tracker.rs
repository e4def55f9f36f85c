//! Tracker (C6, spec §4.6).
//!
//! Per-camera short-term identity assignment. Associates the current
//! frame's detections against existing tracks by a cost combining IoU and
//! embedding cosine distance, in the spirit of a Hungarian assignment:
//! ties are broken by always taking the globally cheapest remaining
//! pair first (a standard greedy approximation of the assignment problem
//! that every one of these trackers in practice can afford, since per-camera
//! track counts are small).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{BBox, CameraId, Detection, LocalTrackId, Track, TrackState};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Consecutive hits required to promote Tentative -> Confirmed.
    pub confirm_hits: u32,
    /// Consecutive misses required to demote Confirmed -> Lost.
    pub demote_misses: u32,
    /// Time since last update after which a track is destroyed outright.
    pub lost_timeout: chrono::Duration,
    /// Weight (lambda) applied to embedding cosine distance in the cost.
    pub embedding_weight: f32,
    /// Maximum cost at which an association is still accepted.
    pub max_association_cost: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            confirm_hits: 3,
            demote_misses: 5,
            lost_timeout: chrono::Duration::seconds(10),
            embedding_weight: 0.5,
            max_association_cost: 0.7,
        }
    }
}

pub struct Tracker {
    camera_id: CameraId,
    config: TrackerConfig,
    tracks: HashMap<LocalTrackId, Track>,
    next_id: LocalTrackId,
}

/// Result of associating one frame's detections against existing tracks.
pub struct AssociationOutcome {
    /// `(detection_index, local_track_id)` pairs, in detection order.
    pub assignments: Vec<(usize, LocalTrackId)>,
}

impl Tracker {
    pub fn new(camera_id: CameraId, config: TrackerConfig) -> Self {
        Tracker {
            camera_id,
            config,
            tracks: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn active_track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, id: LocalTrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Associate `detections` (from one frame at `now`) against current
    /// tracks, updating state in place: hits/misses, promotion/demotion,
    /// and destruction of tracks past `lost_timeout`. Returns the
    /// detection-to-track assignment for this frame.
    pub fn update(&mut self, detections: &[Detection], now: DateTime<Utc>) -> AssociationOutcome {
        let mut candidates: Vec<(f32, usize, LocalTrackId)> = Vec::new();
        for (d_idx, detection) in detections.iter().enumerate() {
            for (&track_id, track) in self.tracks.iter() {
                if track.state == TrackState::Lost {
                    continue;
                }
                let cost = association_cost(detection, track, self.config.embedding_weight);
                if cost <= self.config.max_association_cost {
                    candidates.push((cost, d_idx, track_id));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut assigned_detections = vec![false; detections.len()];
        let mut assigned_tracks: HashMap<LocalTrackId, bool> = HashMap::new();
        let mut assignments = Vec::new();

        for (_, d_idx, track_id) in candidates {
            if assigned_detections[d_idx] || *assigned_tracks.get(&track_id).unwrap_or(&false) {
                continue;
            }
            assigned_detections[d_idx] = true;
            assigned_tracks.insert(track_id, true);
            assignments.push((d_idx, track_id));

            let detection = &detections[d_idx];
            let track = self.tracks.get_mut(&track_id).unwrap();
            track.latest_bbox = detection.bbox;
            track.last_seen = now;
            track.hits += 1;
            track.misses = 0;
            if let Some(embedding) = &detection.embedding {
                track.rolling_embedding = Some(blend_embedding(
                    track.rolling_embedding.as_deref(),
                    embedding,
                ));
            }
            if track.state == TrackState::Tentative && track.hits >= self.config.confirm_hits {
                track.state = TrackState::Confirmed;
                debug!(camera_id = %self.camera_id, local_id = track_id, "track confirmed");
            }
        }

        // Unmatched detections spawn new tentative tracks.
        for (d_idx, detection) in detections.iter().enumerate() {
            if assigned_detections[d_idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                id,
                Track {
                    local_id: id,
                    first_seen: now,
                    last_seen: now,
                    latest_bbox: detection.bbox,
                    rolling_embedding: detection.embedding.clone(),
                    state: TrackState::Tentative,
                    class_label: detection.class_label.clone(),
                    hits: 1,
                    misses: 0,
                },
            );
            assignments.push((d_idx, id));
        }

        // Unmatched tracks accrue a miss, demote, or get destroyed.
        let matched_track_ids: Vec<LocalTrackId> =
            assignments.iter().map(|(_, id)| *id).collect();
        self.tracks.retain(|&id, track| {
            if matched_track_ids.contains(&id) {
                return true;
            }
            track.misses += 1;
            if track.state != TrackState::Lost && track.misses >= self.config.demote_misses {
                track.state = TrackState::Lost;
                debug!(camera_id = %self.camera_id, local_id = id, "track demoted to lost");
            }
            now.signed_duration_since(track.last_seen) < self.config.lost_timeout
        });

        assignments.sort_by_key(|(d_idx, _)| *d_idx);
        AssociationOutcome { assignments }
    }
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let ax2 = a.x + a.width;
    let ay2 = a.y + a.height;
    let bx2 = b.x + b.width;
    let by2 = b.y + b.height;

    let ix1 = a.x.max(b.x);
    let iy1 = a.y.max(b.y);
    let ix2 = ax2.min(bx2);
    let iy2 = ay2.min(by2);

    let iw = (ix2 - ix1).max(0);
    let ih = (iy2 - iy1).max(0);
    let intersection = (iw * ih) as f32;

    let area_a = (a.width.max(0) * a.height.max(0)) as f32;
    let area_b = (b.width.max(0) * b.height.max(0)) as f32;
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}

fn association_cost(detection: &Detection, track: &Track, lambda: f32) -> f32 {
    let iou_cost = 1.0 - iou(&detection.bbox, &track.latest_bbox);
    let embedding_cost = match (&detection.embedding, &track.rolling_embedding) {
        (Some(d), Some(t)) => cosine_distance(d, t),
        _ => 0.0,
    };
    iou_cost + lambda * embedding_cost
}

/// Exponential moving average blend, alpha = 0.9 toward the existing value.
fn blend_embedding(existing: Option<&[f32]>, new: &std::sync::Arc<[f32]>) -> std::sync::Arc<[f32]> {
    match existing {
        Some(existing) if existing.len() == new.len() => {
            let blended: Vec<f32> = existing
                .iter()
                .zip(new.iter())
                .map(|(e, n)| 0.9 * e + 0.1 * n)
                .collect();
            std::sync::Arc::from(blended)
        }
        _ => new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn det(bbox: BBox, embedding: Vec<f32>) -> Detection {
        Detection {
            bbox,
            class_label: "person".into(),
            confidence: 0.9,
            embedding: Some(Arc::from(embedding)),
        }
    }

    #[test]
    fn new_detection_creates_tentative_track() {
        let mut tracker = Tracker::new("cam1".into(), TrackerConfig::default());
        let now = Utc::now();
        let outcome = tracker.update(
            &[det(BBox { x: 0, y: 0, width: 10, height: 10 }, vec![1.0, 0.0])],
            now,
        );
        assert_eq!(outcome.assignments.len(), 1);
        let (_, id) = outcome.assignments[0];
        assert_eq!(tracker.track(id).unwrap().state, TrackState::Tentative);
    }

    #[test]
    fn repeated_hits_promote_to_confirmed() {
        let mut tracker = Tracker::new("cam1".into(), TrackerConfig::default());
        let now = Utc::now();
        let bbox = BBox { x: 0, y: 0, width: 10, height: 10 };
        let mut id = 0;
        for i in 0..3 {
            let outcome = tracker.update(&[det(bbox, vec![1.0, 0.0])], now + chrono::Duration::milliseconds(i));
            id = outcome.assignments[0].1;
        }
        assert_eq!(tracker.track(id).unwrap().state, TrackState::Confirmed);
    }

    #[test]
    fn stable_local_id_across_frames_for_same_object() {
        let mut tracker = Tracker::new("cam1".into(), TrackerConfig::default());
        let now = Utc::now();
        let bbox = BBox { x: 100, y: 100, width: 40, height: 80 };
        let first = tracker.update(&[det(bbox, vec![1.0, 0.0, 0.0])], now);
        let id1 = first.assignments[0].1;

        let moved = BBox { x: 102, y: 101, width: 40, height: 80 };
        let second = tracker.update(&[det(moved, vec![0.99, 0.01, 0.0])], now + chrono::Duration::milliseconds(33));
        let id2 = second.assignments[0].1;

        assert_eq!(id1, id2);
    }

    #[test]
    fn misses_eventually_destroy_the_track() {
        let mut config = TrackerConfig::default();
        config.lost_timeout = chrono::Duration::milliseconds(50);
        config.demote_misses = 1;
        let mut tracker = Tracker::new("cam1".into(), config);
        let now = Utc::now();
        let bbox = BBox { x: 0, y: 0, width: 10, height: 10 };
        tracker.update(&[det(bbox, vec![1.0, 0.0])], now);
        assert_eq!(tracker.active_track_count(), 1);

        // No detections for long enough to exceed lost_timeout.
        tracker.update(&[], now + chrono::Duration::milliseconds(100));
        assert_eq!(tracker.active_track_count(), 0);
    }

    #[test]
    fn distinct_simultaneous_objects_get_distinct_ids() {
        let mut tracker = Tracker::new("cam1".into(), TrackerConfig::default());
        let now = Utc::now();
        let a = det(BBox { x: 0, y: 0, width: 10, height: 10 }, vec![1.0, 0.0]);
        let b = det(BBox { x: 500, y: 500, width: 10, height: 10 }, vec![0.0, 1.0]);
        let outcome = tracker.update(&[a, b], now);
        assert_eq!(outcome.assignments.len(), 2);
        assert_ne!(outcome.assignments[0].1, outcome.assignments[1].1);
    }
}
