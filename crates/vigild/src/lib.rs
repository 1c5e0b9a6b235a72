//! vigild: Proctoring malpractice monitor.
//!
//! Watches the local camera stream of an active video session, runs periodic
//! face detection and publishes debounced malpractice flags.

pub mod adapter;
pub mod binder;
pub mod config;
pub mod dbus_interface;
pub mod detection_loop;
pub mod model_fetch;
pub mod monitor;
pub mod session;

pub use adapter::{DetectionAdapter, DetectorResolver, NoNativeDetector, PlatformProbe};
pub use config::Config;
pub use monitor::{MonitorController, MonitorError, PendingStop};
pub use session::VideoSession;
