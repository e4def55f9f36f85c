//! CrossCameraReconciler (C10, spec §4.10).
//!
//! Merges per-camera local tracks into cross-camera `GlobalTrack`s by
//! embedding similarity, gated by a temporal/topology plausibility check so
//! distant cameras or stale tracks can't merge just because two embeddings
//! happen to be close. All state lives behind one lock at
//! [`crate::locks::LockLevel::CrossCamera`]; nothing else is held across
//! entry into this module (spec: "no pipeline lock is held across its
//! entry").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::locks::{LockLevel, LockToken};
use crate::types::{CameraId, GlobalTrack, GlobalTrackId, LocalTrackId};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub tau_high: f32,
    pub tau_low: f32,
    /// Maximum plausible gap between two cameras' last-seen times for a
    /// tau_low-band candidate to still be considered the same object.
    pub max_temporal_gap: chrono::Duration,
    /// Camera pairs that can never refer to the same physical space (e.g.
    /// opposite ends of a building with no walkway between them).
    pub forbidden_pairs: Vec<(CameraId, CameraId)>,
    pub global_ttl: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            tau_high: 0.8,
            tau_low: 0.6,
            max_temporal_gap: chrono::Duration::seconds(5),
            forbidden_pairs: Vec::new(),
            global_ttl: chrono::Duration::seconds(60),
        }
    }
}

struct Inner {
    globals: HashMap<GlobalTrackId, GlobalTrack>,
    reverse_index: HashMap<(CameraId, LocalTrackId), GlobalTrackId>,
    next_id: GlobalTrackId,
}

pub struct CrossCameraReconciler {
    config: ReconcilerConfig,
    inner: Mutex<Inner>,
}

impl CrossCameraReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        CrossCameraReconciler {
            config,
            inner: Mutex::new(Inner {
                globals: HashMap::new(),
                reverse_index: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Resolve (or assign) a global id for one local track observation.
    pub fn resolve(
        &self,
        camera_id: &CameraId,
        local_id: LocalTrackId,
        embedding: &Arc<[f32]>,
        now: DateTime<Utc>,
    ) -> GlobalTrackId {
        let _lock = LockToken::acquire(LockLevel::CrossCamera);
        let mut inner = self.inner.lock();

        let key = (camera_id.clone(), local_id);
        if let Some(&global_id) = inner.reverse_index.get(&key) {
            if let Some(global) = inner.globals.get_mut(&global_id) {
                global.last_activity = now;
            }
            return global_id;
        }

        let mut best: Option<(GlobalTrackId, f32)> = None;
        for (id, global) in inner.globals.iter() {
            let similarity = cosine_similarity(embedding, &global.representative_embedding);
            let passes = similarity >= self.config.tau_high
                || (similarity >= self.config.tau_low
                    && self.temporally_plausible(global, now)
                    && !self.topology_forbidden(camera_id, global));
            if !passes {
                continue;
            }
            match best {
                None => best = Some((*id, similarity)),
                Some((_, best_similarity)) => {
                    if similarity > best_similarity
                        || (similarity == best_similarity
                            && inner.globals[id].last_activity
                                > inner.globals[&best.unwrap().0].last_activity)
                    {
                        best = Some((*id, similarity));
                    }
                }
            }
        }

        let global_id = match best {
            Some((id, _)) => id,
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                inner.globals.insert(
                    id,
                    GlobalTrack {
                        global_id: id,
                        members: Vec::new(),
                        representative_embedding: embedding.clone(),
                        last_activity: now,
                    },
                );
                debug!(camera_id = %camera_id, local_id, global_id = id, "allocated fresh global track");
                id
            }
        };

        let global = inner.globals.get_mut(&global_id).unwrap();
        global.representative_embedding = ema_blend(&global.representative_embedding, embedding, 0.8);
        global.members.push((camera_id.clone(), local_id));
        global.last_activity = now;
        inner.reverse_index.insert(key, global_id);
        global_id
    }

    fn temporally_plausible(&self, global: &GlobalTrack, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(global.last_activity) <= self.config.max_temporal_gap
    }

    fn topology_forbidden(&self, camera_id: &CameraId, global: &GlobalTrack) -> bool {
        self.config.forbidden_pairs.iter().any(|(a, b)| {
            global
                .members
                .iter()
                .any(|(member_camera, _)| (a == camera_id && b == member_camera) || (b == camera_id && a == member_camera))
        })
    }

    /// Remove GlobalTracks idle past `globalTTL`. IDs are never recycled:
    /// the monotonic allocator simply never revisits a freed id.
    pub fn garbage_collect(&self, now: DateTime<Utc>) -> usize {
        let _lock = LockToken::acquire(LockLevel::CrossCamera);
        let mut inner = self.inner.lock();
        let expired: Vec<GlobalTrackId> = inner
            .globals
            .iter()
            .filter(|(_, g)| now.signed_duration_since(g.last_activity) > self.config.global_ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(global) = inner.globals.remove(id) {
                for member in global.members {
                    inner.reverse_index.remove(&member);
                }
            }
        }
        expired.len()
    }

    pub fn active_global_count(&self) -> usize {
        self.inner.lock().globals.len()
    }

    pub fn global_track(&self, id: GlobalTrackId) -> Option<GlobalTrack> {
        self.inner.lock().globals.get(&id).cloned()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn ema_blend(existing: &[f32], new: &[f32], alpha: f32) -> Arc<[f32]> {
    if existing.len() != new.len() {
        return Arc::from(new.to_vec());
    }
    let blended: Vec<f32> = existing
        .iter()
        .zip(new.iter())
        .map(|(e, n)| alpha * e + (1.0 - alpha) * n)
        .collect();
    Arc::from(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(v: Vec<f32>) -> Arc<[f32]> {
        Arc::from(v)
    }

    #[test]
    fn same_local_track_always_resolves_to_same_global_id() {
        let reconciler = CrossCameraReconciler::new(ReconcilerConfig::default());
        let now = Utc::now();
        let emb = embedding(vec![1.0, 0.0, 0.0]);
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &emb, now);
        let g2 = reconciler.resolve(&"cam1".to_string(), 1, &emb, now + chrono::Duration::seconds(1));
        assert_eq!(g1, g2);
    }

    #[test]
    fn distinct_cameras_with_similar_embedding_merge_above_tau_high() {
        let reconciler = CrossCameraReconciler::new(ReconcilerConfig::default());
        let now = Utc::now();
        let emb_a = embedding(vec![1.0, 0.0, 0.0]);
        let emb_b = embedding(vec![0.99, 0.01, 0.0]);
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &emb_a, now);
        let g2 = reconciler.resolve(&"cam2".to_string(), 1, &emb_b, now);
        assert_eq!(g1, g2);
    }

    #[test]
    fn dissimilar_embeddings_get_distinct_global_ids() {
        let reconciler = CrossCameraReconciler::new(ReconcilerConfig::default());
        let now = Utc::now();
        let emb_a = embedding(vec![1.0, 0.0, 0.0]);
        let emb_b = embedding(vec![0.0, 1.0, 0.0]);
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &emb_a, now);
        let g2 = reconciler.resolve(&"cam2".to_string(), 1, &emb_b, now);
        assert_ne!(g1, g2);
    }

    #[test]
    fn temporal_gap_blocks_a_tau_low_band_merge() {
        let mut config = ReconcilerConfig::default();
        config.tau_high = 0.999;
        config.tau_low = 0.5;
        config.max_temporal_gap = chrono::Duration::seconds(2);
        let reconciler = CrossCameraReconciler::new(config);
        let now = Utc::now();
        let emb_a = embedding(vec![1.0, 0.0, 0.0]);
        let emb_b = embedding(vec![0.9, 0.1, 0.0]);
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &emb_a, now);
        let g2 = reconciler.resolve(
            &"cam2".to_string(),
            1,
            &emb_b,
            now + chrono::Duration::seconds(30),
        );
        assert_ne!(g1, g2, "stale global should not absorb a tau_low candidate");
    }

    #[test]
    fn topology_forbidden_pair_never_merges() {
        let mut config = ReconcilerConfig::default();
        config.tau_high = 0.999;
        config.tau_low = 0.5;
        config.forbidden_pairs = vec![("cam1".to_string(), "cam2".to_string())];
        let reconciler = CrossCameraReconciler::new(config);
        let now = Utc::now();
        let emb_a = embedding(vec![1.0, 0.0, 0.0]);
        let emb_b = embedding(vec![0.9, 0.1, 0.0]);
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &emb_a, now);
        let g2 = reconciler.resolve(&"cam2".to_string(), 1, &emb_b, now);
        assert_ne!(g1, g2);
    }

    #[test]
    fn garbage_collection_never_recycles_ids() {
        let mut config = ReconcilerConfig::default();
        config.global_ttl = chrono::Duration::milliseconds(10);
        let reconciler = CrossCameraReconciler::new(config);
        let now = Utc::now();
        let g1 = reconciler.resolve(&"cam1".to_string(), 1, &embedding(vec![1.0, 0.0]), now);

        let collected = reconciler.garbage_collect(now + chrono::Duration::milliseconds(50));
        assert_eq!(collected, 1);
        assert_eq!(reconciler.active_global_count(), 0);

        let g2 = reconciler.resolve(
            &"cam1".to_string(),
            2,
            &embedding(vec![1.0, 0.0]),
            now + chrono::Duration::milliseconds(60),
        );
        assert!(g2 > g1, "freed id must never be recycled");
    }
}
