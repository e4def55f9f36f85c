//! PortRegistry (C1, spec §4.1).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{AppError, AppResult};
use crate::locks::{LockLevel, LockToken};
use crate::types::CameraId;

struct Inner {
    range_start: u16,
    range_end: u16,
    next: u16,
    by_camera: HashMap<CameraId, u16>,
    in_use: HashMap<u16, CameraId>,
}

/// Allocates unique preview-stream ports out of a contiguous range.
/// Thread-safe under a single internal lock (spec: "Thread-safe under a
/// single internal lock").
pub struct PortRegistry {
    inner: Mutex<Inner>,
}

impl PortRegistry {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        assert!(range_start <= range_end, "empty port range");
        PortRegistry {
            inner: Mutex::new(Inner {
                range_start,
                range_end,
                next: range_start,
                by_camera: HashMap::new(),
                in_use: HashMap::new(),
            }),
        }
    }

    /// Allocate a port for `camera_id`. Re-allocation for a camera that
    /// already holds a port returns the same port. Scans the full range
    /// starting from a rotating cursor so repeated churn doesn't always
    /// retry the same recently-freed port first.
    pub fn allocate(&self, camera_id: &CameraId) -> AppResult<u16> {
        let _lock = LockToken::acquire(LockLevel::PreviewPorts);
        let mut inner = self.inner.lock();

        if let Some(&port) = inner.by_camera.get(camera_id) {
            return Ok(port);
        }

        let span = (inner.range_end - inner.range_start + 1) as u32;
        for offset in 0..span {
            let candidate = inner.range_start + (((inner.next - inner.range_start) as u32 + offset) % span) as u16;
            if !inner.in_use.contains_key(&candidate) {
                inner.in_use.insert(candidate, camera_id.clone());
                inner.by_camera.insert(camera_id.clone(), candidate);
                inner.next = if candidate == inner.range_end {
                    inner.range_start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
        }

        Err(AppError::ResourceExhausted(format!(
            "no free preview port in range {}..={}",
            inner.range_start, inner.range_end
        )))
    }

    /// Release the port held by `camera_id`, if any. Idempotent.
    pub fn release(&self, camera_id: &CameraId) {
        let _lock = LockToken::acquire(LockLevel::PreviewPorts);
        let mut inner = self.inner.lock();
        if let Some(port) = inner.by_camera.remove(camera_id) {
            inner.in_use.remove(&port);
        }
    }

    pub fn port_of(&self, camera_id: &CameraId) -> Option<u16> {
        let _lock = LockToken::acquire(LockLevel::PreviewPorts);
        self.inner.lock().by_camera.get(camera_id).copied()
    }

    /// Number of ports currently allocated. Exposed for status/testing.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ports_per_camera() {
        let registry = PortRegistry::new(9000, 9002);
        let p1 = registry.allocate(&"cam1".to_string()).unwrap();
        let p2 = registry.allocate(&"cam2".to_string()).unwrap();
        let p3 = registry.allocate(&"cam3".to_string()).unwrap();
        assert_ne!(p1, p2);
        assert_ne!(p2, p3);
        assert_ne!(p1, p3);
    }

    #[test]
    fn exhausts_and_reports_resource_exhausted() {
        let registry = PortRegistry::new(9000, 9001);
        registry.allocate(&"cam1".to_string()).unwrap();
        registry.allocate(&"cam2".to_string()).unwrap();
        let err = registry.allocate(&"cam3".to_string()).unwrap_err();
        assert_eq!(err.kind(), "ResourceExhausted");
    }

    #[test]
    fn re_allocating_same_camera_is_idempotent() {
        let registry = PortRegistry::new(9000, 9005);
        let p1 = registry.allocate(&"cam1".to_string()).unwrap();
        let p1_again = registry.allocate(&"cam1".to_string()).unwrap();
        assert_eq!(p1, p1_again);
    }

    #[test]
    fn release_frees_the_port_for_reuse() {
        let registry = PortRegistry::new(9000, 9000);
        let cam1 = "cam1".to_string();
        let p1 = registry.allocate(&cam1).unwrap();
        registry.release(&cam1);
        assert_eq!(registry.port_of(&cam1), None);
        let cam2 = "cam2".to_string();
        let p2 = registry.allocate(&cam2).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn no_two_cameras_share_a_port_under_churn() {
        let registry = PortRegistry::new(9000, 9003);
        let mut held = Vec::new();
        for i in 0..4 {
            let id = format!("cam{i}");
            held.push((id.clone(), registry.allocate(&id).unwrap()));
        }
        let mut ports: Vec<_> = held.iter().map(|(_, p)| *p).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }
}
