//! Inferencer (C5, spec §4.5, §9 "Polymorphism over inferencers").
//!
//! Models are opaque inference backends exposing `infer(image) ->
//! detections/embedding`. Rather than compile-time conditional backends per
//! model family, a pipeline carries one `Inferencer` handle whose
//! capability set is checked at startup against what the pipeline's
//! detection config requires; models are discovered/loaded once and pinned
//! for the pipeline's lifetime.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::types::{BBox, Detection, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Detect,
    Embed,
    RecognizeFace,
    RecognizePlate,
}

/// A label recognized against a gallery (face or plate).
#[derive(Debug, Clone)]
pub struct RecognitionLabel {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct InferenceResult {
    pub detections: Vec<Detection>,
    pub face_labels: Vec<RecognitionLabel>,
    pub plate_labels: Vec<RecognitionLabel>,
}

/// The model backend contract. Implementations are free to be re-entrant
/// (safe to call `infer` from multiple threads concurrently) or not; if
/// not, they serialize internally (see [`SerializedBackend`]).
pub trait InferenceBackend: Send + Sync {
    fn capabilities(&self) -> &HashSet<Capability>;
    /// Run inference on one frame. Never returns an error to the pipeline:
    /// failure is non-fatal per spec §4.5 and is represented as an empty
    /// result with the failure logged by the implementation.
    fn infer(&self, frame: &Frame) -> InferenceResult;
}

/// Wraps a non-reentrant backend behind a mutex so pipelines can still
/// treat all `Inferencer`s uniformly as thread-safe.
pub struct SerializedBackend<B> {
    inner: Mutex<B>,
    capabilities: HashSet<Capability>,
}

impl<B> SerializedBackend<B> {
    pub fn new(backend: B, capabilities: HashSet<Capability>) -> Self {
        SerializedBackend {
            inner: Mutex::new(backend),
            capabilities,
        }
    }
}

/// A backend that can run inference without external synchronization.
pub trait ReentrantModel: Send {
    fn infer(&self, frame: &Frame) -> InferenceResult;
}

impl<B: ReentrantModel> InferenceBackend for SerializedBackend<B> {
    fn capabilities(&self) -> &HashSet<Capability> {
        &self.capabilities
    }

    fn infer(&self, frame: &Frame) -> InferenceResult {
        let guard = self.inner.lock();
        guard.infer(frame)
    }
}

/// The handle a [`crate::pipeline::VideoPipeline`] holds. Thin wrapper so
/// call sites don't need to reach through an `Arc<dyn InferenceBackend>`
/// directly and so a missing capability degrades to an empty result rather
/// than a panic.
#[derive(Clone)]
pub struct Inferencer {
    backend: Arc<dyn InferenceBackend>,
}

impl Inferencer {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Inferencer { backend }
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.backend.capabilities().contains(&cap)
    }

    pub fn required_capabilities_present(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.has_capability(*c))
    }

    /// Detect + embed (the minimum every pipeline needs). Returns an empty
    /// result, logging a warning, if the backend lacks `Detect`.
    pub fn detect(&self, frame: &Frame) -> InferenceResult {
        if !self.has_capability(Capability::Detect) {
            warn!(camera_id = %frame.camera_id, "inferencer lacks Detect capability");
            return InferenceResult::default();
        }
        self.backend.infer(frame)
    }
}

/// A deterministic stub backend useful for tests and for running the
/// pipeline end-to-end without a real model loaded.
pub struct StubBackend {
    pub capabilities: HashSet<Capability>,
    pub fixed_bbox: BBox,
    pub class_label: String,
    pub confidence: f32,
}

impl Default for StubBackend {
    fn default() -> Self {
        let mut caps = HashSet::new();
        caps.insert(Capability::Detect);
        caps.insert(Capability::Embed);
        StubBackend {
            capabilities: caps,
            fixed_bbox: BBox {
                x: 10,
                y: 10,
                width: 50,
                height: 100,
            },
            class_label: "person".to_string(),
            confidence: 0.9,
        }
    }
}

impl InferenceBackend for StubBackend {
    fn capabilities(&self) -> &HashSet<Capability> {
        &self.capabilities
    }

    fn infer(&self, _frame: &Frame) -> InferenceResult {
        InferenceResult {
            detections: vec![Detection {
                bbox: self.fixed_bbox,
                class_label: self.class_label.clone(),
                confidence: self.confidence,
                embedding: Some(Arc::from(vec![0.1f32; 8])),
            }],
            face_labels: Vec::new(),
            plate_labels: Vec::new(),
        }
    }
}
