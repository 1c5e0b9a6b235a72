//! vigil-hw: Hardware abstraction for camera capture and live video streams.
//!
//! Provides V4L2-based camera access and a pollable [`VideoStream`] that the
//! monitor daemon binds its frame surface to.

pub mod camera;
pub mod frame;
pub mod stream;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use stream::{CameraStream, FrameSource, SharedStream, SourceOpener, StreamError, VideoStream};
