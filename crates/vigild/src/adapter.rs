//! Detector adapter layer.
//!
//! Resolves a face detection backend and wraps it behind [`DetectionAdapter`],
//! which reports pixel-space boxes and can be disposed. The platform-native
//! detector is preferred; the ML fallback is only built when no native
//! detector exists, so the native path never touches the shared runtime.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use vigil_core::model::to_pixel_boxes;
use vigil_core::{
    DetectionBox, DetectorError, DetectorSource, ExecutionBackend, FaceModel, MlRuntime,
    ModelFactory, ModelRuntime, RuntimeCell, MAX_TRACKED_FACES,
};
use vigil_hw::Frame;

use crate::model_fetch::{FetchError, ModelSource};

pub type NativeError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("model fetch: {0}")]
    Fetch(#[from] FetchError),
    #[error("native detector: {0}")]
    Native(NativeError),
    #[error("detector worker failed: {0}")]
    Worker(String),
}

/// Uniform face detection interface over the native and fallback backends.
#[async_trait]
pub trait DetectionAdapter: Send {
    fn source(&self) -> DetectorSource;

    /// Detect faces in `frame`, returning pixel-space boxes.
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, AdapterError>;

    /// Release backend resources. Failures are reported but never fatal.
    fn dispose(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Options handed to a native detector on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDetectorOptions {
    pub fast_mode: bool,
    pub max_detected_faces: usize,
}

impl NativeDetectorOptions {
    pub const MONITORING: Self = Self {
        fast_mode: true,
        max_detected_faces: MAX_TRACKED_FACES,
    };
}

/// A platform face detector. Boxes are already in pixel space.
pub trait NativeFaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, NativeError>;

    fn close(&mut self) -> Result<(), NativeError> {
        Ok(())
    }
}

/// Probes the host platform for a built-in face detector.
pub trait PlatformProbe: Send + Sync {
    fn native_detector(&self, options: NativeDetectorOptions) -> Option<Box<dyn NativeFaceDetector>>;
}

/// Probe for hosts without a platform face detector.
pub struct NoNativeDetector;

impl PlatformProbe for NoNativeDetector {
    fn native_detector(&self, _options: NativeDetectorOptions) -> Option<Box<dyn NativeFaceDetector>> {
        None
    }
}

/// Native detector adapter. Detection runs on the blocking pool so a stalled
/// platform call never pins a runtime worker.
pub struct NativeAdapter {
    detector: Arc<Mutex<Box<dyn NativeFaceDetector>>>,
}

impl NativeAdapter {
    pub fn new(detector: Box<dyn NativeFaceDetector>) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
        }
    }
}

#[async_trait]
impl DetectionAdapter for NativeAdapter {
    fn source(&self) -> DetectorSource {
        DetectorSource::Native
    }

    async fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, AdapterError> {
        let detector = Arc::clone(&self.detector);
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || {
            let mut detector = detector
                .lock()
                .map_err(|_| AdapterError::Worker("native detector lock poisoned".into()))?;
            let mut boxes = detector.detect(&frame).map_err(AdapterError::Native)?;
            boxes.truncate(MAX_TRACKED_FACES);
            Ok::<_, AdapterError>(boxes)
        })
        .await
        .map_err(|e| AdapterError::Worker(e.to_string()))?
    }

    /// Closes the detector. A detect call still running on the blocking pool
    /// holds the lock; disposal then waits for it to return.
    fn dispose(&mut self) -> Result<(), AdapterError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| AdapterError::Worker("native detector lock poisoned".into()))?;
        detector.close().map_err(AdapterError::Native)
    }
}

/// ML fallback adapter. Inference runs on the blocking pool.
pub struct FallbackAdapter {
    model: Arc<Mutex<Box<dyn FaceModel>>>,
    backend: String,
    path: ModelRuntime,
}

impl FallbackAdapter {
    pub fn new(model: Box<dyn FaceModel>, backend: &str, path: ModelRuntime) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            backend: backend.to_string(),
            path,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn model_runtime(&self) -> ModelRuntime {
        self.path
    }
}

#[async_trait]
impl DetectionAdapter for FallbackAdapter {
    fn source(&self) -> DetectorSource {
        DetectorSource::Fallback
    }

    async fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>, AdapterError> {
        let model = Arc::clone(&self.model);
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| AdapterError::Worker("face model lock poisoned".into()))?;
            let raw = model.estimate_faces(&frame.data, frame.width, frame.height)?;
            Ok::<_, AdapterError>(to_pixel_boxes(&raw, frame.width, frame.height))
        })
        .await
        .map_err(|e| AdapterError::Worker(e.to_string()))?
    }
}

/// Picks and constructs the detection adapter for a monitoring session.
pub struct DetectorResolver {
    probe: Arc<dyn PlatformProbe>,
    runtime: &'static RuntimeCell,
    backends: Vec<Arc<dyn ExecutionBackend>>,
    models: Arc<dyn ModelFactory>,
    model_source: Option<ModelSource>,
}

impl DetectorResolver {
    pub fn new(
        probe: Arc<dyn PlatformProbe>,
        runtime: &'static RuntimeCell,
        backends: Vec<Arc<dyn ExecutionBackend>>,
        models: Arc<dyn ModelFactory>,
    ) -> Self {
        Self {
            probe,
            runtime,
            backends,
            models,
            model_source: None,
        }
    }

    /// Make sure the fallback model file is present before building it.
    pub fn with_model_source(mut self, source: ModelSource) -> Self {
        self.model_source = Some(source);
        self
    }

    pub fn runtime(&self) -> &'static RuntimeCell {
        self.runtime
    }

    /// Resolve a ready adapter: native first, then the ML fallback.
    pub async fn resolve(&self) -> Result<Box<dyn DetectionAdapter>, AdapterError> {
        let probe = Arc::clone(&self.probe);
        let native = tokio::task::spawn_blocking(move || probe.native_detector(NativeDetectorOptions::MONITORING))
            .await
            .map_err(|e| AdapterError::Worker(e.to_string()))?;
        if let Some(native) = native {
            tracing::info!(source = %DetectorSource::Native, "face detector resolved");
            return Ok(Box::new(NativeAdapter::new(native)));
        }

        if let Some(source) = &self.model_source {
            source.ensure().await?;
        }

        let runtime = self.runtime;
        let backends = self.backends.clone();
        let models = Arc::clone(&self.models);
        tokio::task::spawn_blocking(move || {
            let runtime = runtime.get_or_init(&backends)?;
            build_fallback(&runtime, models.as_ref())
        })
        .await
        .map_err(|e| AdapterError::Worker(e.to_string()))?
    }
}

fn build_fallback(
    runtime: &MlRuntime,
    models: &dyn ModelFactory,
) -> Result<Box<dyn DetectionAdapter>, AdapterError> {
    let mut last_error = None;
    for path in ModelRuntime::FALLBACK_ORDER {
        match models.build(runtime, path) {
            Ok(model) => {
                tracing::info!(
                    source = %DetectorSource::Fallback,
                    backend = runtime.backend_name(),
                    runtime = path.name(),
                    "face detector resolved"
                );
                return Ok(Box::new(FallbackAdapter::new(
                    model,
                    runtime.backend_name(),
                    path,
                )));
            }
            Err(e) => {
                tracing::warn!(
                    backend = runtime.backend_name(),
                    runtime = path.name(),
                    phase = "model-init",
                    error = %e,
                    "fallback face model failed to initialize"
                );
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| DetectorError::BackendUnavailable("no model runtimes configured".into()))
        .into())
}
