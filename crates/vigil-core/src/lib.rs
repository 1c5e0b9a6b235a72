//! vigil-core: Proctoring flag engine and face detection runtime.
//!
//! Holds the monitoring data model, the debounced flag state engine, the
//! process-wide ML runtime memo, and the SCRFD face model used as the
//! downloadable fallback detector.

pub mod detector;
pub mod flags;
pub mod model;
pub mod runtime;
pub mod types;

pub use detector::DetectorError;
pub use flags::FlagEngine;
pub use model::{FaceModel, ModelFactory, ModelRuntime, ScrfdModelFactory, MAX_TRACKED_FACES};
pub use runtime::{shared_runtime, ExecutionBackend, MlRuntime, OrtBackend, RuntimeCell, RuntimeStatus};
pub use types::{
    BoundingBox, DetectionBox, DetectionSnapshot, DetectorSource, Flag, FlagType, MonitorState,
};
