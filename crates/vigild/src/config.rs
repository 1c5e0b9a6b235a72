use std::path::PathBuf;

/// Default SCRFD export: small, keypoint-free, good enough for presence checks.
const DEFAULT_MODEL_NAME: &str = "det_500m.onnx";

/// Daemon configuration, loaded from environment variables.
///
/// Detection thresholds and the polling interval are fixed constants and are
/// deliberately absent here.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device used when a session does not name one (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the fallback face model.
    pub model_dir: PathBuf,
    /// File name of the fallback face model inside `model_dir`.
    pub model_name: String,
    /// Where to download the model from when it is missing locally.
    pub model_url: Option<String>,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("models"));

        Self {
            camera_device: std::env::var("VIGIL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            model_name: std::env::var("VIGIL_MODEL_NAME")
                .unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_string()),
            model_url: std::env::var("VIGIL_MODEL_URL")
                .ok()
                .filter(|u| !u.trim().is_empty()),
            system_bus: std::env::var("VIGIL_SYSTEM_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Full path to the fallback face model.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_name)
    }

    /// Resolve the device for a session request; empty means the default.
    pub fn device_or_default<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.trim().is_empty() {
            &self.camera_device
        } else {
            requested
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}
