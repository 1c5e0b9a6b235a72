//! Face model abstraction for the ML fallback backend.
//!
//! A [`ModelFactory`] builds a [`FaceModel`] on an initialized [`MlRuntime`]
//! for a given [`ModelRuntime`] execution path. Resolution code tries the
//! accelerated path first and the portable path second.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::runtime::MlRuntime;
use crate::types::{BoundingBox, DetectionBox};
use std::path::PathBuf;

/// Upper bound on faces reported per frame by any backend.
pub const MAX_TRACKED_FACES: usize = 5;

/// Execution path for a face model session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRuntime {
    /// Session bound to the runtime's selected execution provider.
    Accelerated,
    /// Plain CPU session.
    Portable,
}

impl ModelRuntime {
    pub const FALLBACK_ORDER: [ModelRuntime; 2] = [ModelRuntime::Accelerated, ModelRuntime::Portable];

    pub fn name(self) -> &'static str {
        match self {
            ModelRuntime::Accelerated => "accelerated",
            ModelRuntime::Portable => "portable",
        }
    }
}

/// A loaded face detection model operating on grayscale frames.
pub trait FaceModel: Send {
    fn estimate_faces(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Builds face models for a given execution path.
pub trait ModelFactory: Send + Sync {
    fn build(
        &self,
        runtime: &MlRuntime,
        path: ModelRuntime,
    ) -> Result<Box<dyn FaceModel>, DetectorError>;
}

impl FaceModel for ScrfdDetector {
    fn estimate_faces(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect(frame, width, height)
    }
}

/// Builds [`ScrfdDetector`] sessions from a model file on disk.
pub struct ScrfdModelFactory {
    model_path: PathBuf,
}

impl ScrfdModelFactory {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }
}

impl ModelFactory for ScrfdModelFactory {
    fn build(
        &self,
        runtime: &MlRuntime,
        path: ModelRuntime,
    ) -> Result<Box<dyn FaceModel>, DetectorError> {
        let model_path = self.model_path.to_string_lossy();
        let providers = match path {
            ModelRuntime::Accelerated => runtime.execution_providers(),
            ModelRuntime::Portable => Vec::new(),
        };
        let detector = ScrfdDetector::load_with(&model_path, providers)?;
        Ok(Box::new(detector))
    }
}

/// Convert raw model boxes into pixel-space detection boxes.
///
/// Boxes whose extents all fit in [0, 1] are treated as normalized and scaled
/// by the frame size; without a usable frame size they pass through as-is.
/// At most [`MAX_TRACKED_FACES`] boxes are kept.
pub fn to_pixel_boxes(raw: &[BoundingBox], frame_width: u32, frame_height: u32) -> Vec<DetectionBox> {
    let normalized = frame_width > 0
        && frame_height > 0
        && raw.iter().all(|b| {
            b.x.max(b.x + b.width) <= 1.0 && b.y.max(b.y + b.height) <= 1.0
        });

    let (sx, sy) = if normalized {
        (frame_width as f32, frame_height as f32)
    } else {
        (1.0, 1.0)
    };

    raw.iter()
        .take(MAX_TRACKED_FACES)
        .map(|b| DetectionBox::new(b.x * sx, b.y * sy, b.width * sx, b.height * sy))
        .collect()
}
