use std::sync::Arc;
use tokio::sync::Mutex;
use vigil_core::{MonitorState, RuntimeStatus};
use vigil_hw::{CameraStream, SharedStream};
use zbus::interface;

use crate::config::Config;
use crate::monitor::{MonitorController, PendingStop};
use crate::session::VideoSession;

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

/// Builds the local stream for a camera device.
pub type StreamFactory = Box<dyn Fn(&str) -> SharedStream + Send + Sync>;

/// Owns the active video session and its monitor.
pub struct SessionHost {
    config: Config,
    controller: MonitorController,
    session: Option<VideoSession>,
    streams: StreamFactory,
}

impl SessionHost {
    pub fn new(config: Config, controller: MonitorController) -> Self {
        Self::with_stream_factory(
            config,
            controller,
            Box::new(|device: &str| Arc::new(CameraStream::new(device)) as SharedStream),
        )
    }

    pub fn with_stream_factory(config: Config, controller: MonitorController, streams: StreamFactory) -> Self {
        Self {
            config,
            controller,
            session: None,
            streams,
        }
    }

    pub fn controller(&self) -> &MonitorController {
        &self.controller
    }

    /// Start a new session on `device`, replacing any existing one.
    ///
    /// The replaced monitor is returned still winding down; await it after
    /// releasing any lock held on the host.
    pub fn start_session(&mut self, device: &str) -> (String, PendingStop) {
        let device = self.config.device_or_default(device).to_string();
        let session = VideoSession::new(Some((self.streams)(&device)));
        let id = session.id().to_string();
        tracing::info!(session = %id, device = %device, "session started");

        let pending = self.controller.switch_session(Some(&session));
        self.session = Some(session);
        (id, pending)
    }

    /// End the active session. Returns `false` when none was active.
    pub fn end_session(&mut self) -> (bool, PendingStop) {
        let pending = self.controller.switch_session(None);
        let ended = match self.session.take() {
            Some(session) => {
                tracing::info!(session = %session.id(), "session ended");
                true
            }
            None => false,
        };
        (ended, pending)
    }

    pub fn switch_camera(&self, device: &str) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let device = self.config.device_or_default(device);
        session.replace_stream((self.streams)(device));
        true
    }

    pub fn detach_camera(&self) -> bool {
        match &self.session {
            Some(session) => {
                session.remove_stream();
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let session = self.session.as_ref().map(|s| {
            serde_json::json!({
                "id": s.id().to_string(),
                "stream": s.current_stream().map(|st| st.id().to_string()),
            })
        });
        let runtime = match self.controller.resolver().runtime().status() {
            RuntimeStatus::Uninitialized => serde_json::json!({ "status": "uninitialized" }),
            RuntimeStatus::Initializing => serde_json::json!({ "status": "initializing" }),
            RuntimeStatus::Ready { backend } => serde_json::json!({ "status": "ready", "backend": backend }),
            RuntimeStatus::Failed { reason } => serde_json::json!({ "status": "failed", "reason": reason }),
        };
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": session,
            "monitor": self.controller.state(),
            "runtime": runtime,
        })
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.controller.state()
    }
}

/// D-Bus interface for the Vigil proctoring monitor.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    host: Arc<Mutex<SessionHost>>,
}

impl VigilService {
    pub fn new(host: Arc<Mutex<SessionHost>>) -> Self {
        Self { host }
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Start a monitored session on a camera device ("" for the default).
    async fn start_session(&self, camera_device: &str) -> zbus::fdo::Result<String> {
        tracing::info!(camera_device, "start_session requested");
        let (id, pending) = self.host.lock().await.start_session(camera_device);
        pending.wait().await;
        Ok(id)
    }

    /// End the active session.
    async fn end_session(&self) -> zbus::fdo::Result<bool> {
        let (ended, pending) = self.host.lock().await.end_session();
        pending.wait().await;
        Ok(ended)
    }

    /// Replace the active session's camera stream.
    async fn switch_camera(&self, camera_device: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(camera_device, "switch_camera requested");
        Ok(self.host.lock().await.switch_camera(camera_device))
    }

    /// Remove the active session's camera stream.
    async fn detach_camera(&self) -> zbus::fdo::Result<bool> {
        Ok(self.host.lock().await.detach_camera())
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.host.lock().await.status().to_string())
    }
}
