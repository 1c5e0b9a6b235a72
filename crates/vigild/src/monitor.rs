//! Session lifecycle controller.
//!
//! Starts monitoring when a video session becomes active and tears it down
//! when the session ends or changes. Each monitoring run is a single task that
//! resolves a detector, binds the frame surface and drives the detection loop.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::MonitorState;
use vigil_hw::SharedStream;

use crate::adapter::DetectorResolver;
use crate::binder::FrameSurface;
use crate::detection_loop::{
    dispose_adapter, publish_unless_cancelled, CancelFlag, DetectionLoop, StatePublisher,
};
use crate::session::VideoSession;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("face detector unavailable: {0}")]
    DetectorUnavailable(String),
    #[error("face detection failed: {0}")]
    DetectionFailure(String),
}

/// How long a stop waits for the cancelled task before detaching it.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// A running monitor bound to one session.
struct Monitor {
    session_id: Uuid,
    cancel: CancelFlag,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    fn start(session: &VideoSession, resolver: Arc<DetectorResolver>, state: StatePublisher) -> Self {
        let cancel = CancelFlag::new();
        let streams = session.subscribe();
        let task = tokio::spawn(drive(resolver, streams, state, cancel.clone()));
        tracing::info!(session = %session.id(), "monitoring started");
        Self {
            session_id: session.id(),
            cancel,
            task: Some(task),
        }
    }

    /// Wait up to [`STOP_GRACE`] for the cancelled task. A task still stuck in
    /// a detection call is detached; it disposes its adapter when the call
    /// returns and cannot publish after cancellation.
    async fn stop(mut self) {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(STOP_GRACE, task).await {
            Ok(Ok(())) => tracing::info!(session = %self.session_id, "monitoring stopped"),
            Ok(Err(e)) => {
                tracing::warn!(session = %self.session_id, error = %e, "monitor task ended abnormally");
            }
            Err(_) => tracing::warn!(
                session = %self.session_id,
                grace_ms = STOP_GRACE.as_millis() as u64,
                "monitor task still busy after cancel; detached"
            ),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A cancelled monitor whose task may still be winding down.
///
/// Published state is already reset when this is returned, so callers can
/// release their locks before awaiting [`wait`](Self::wait). Dropping it
/// detaches the task.
#[must_use = "await `wait` to let the cancelled monitor finish"]
#[derive(Default)]
pub struct PendingStop {
    monitor: Option<Monitor>,
}

impl PendingStop {
    pub fn is_empty(&self) -> bool {
        self.monitor.is_none()
    }

    pub async fn wait(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }
}

async fn drive(
    resolver: Arc<DetectorResolver>,
    streams: watch::Receiver<Option<SharedStream>>,
    state: StatePublisher,
    cancel: CancelFlag,
) {
    let surface = FrameSurface::new();
    let resolved = resolver.resolve().await;

    match resolved {
        Ok(adapter) => {
            let source = adapter.source();
            let published = publish_unless_cancelled(&state, &cancel, |s| {
                s.detector_available = true;
                s.detector_source = Some(source);
                s.is_monitoring = true;
                s.error = None;
                true
            });
            if !published {
                tracing::debug!(source = %source, "detector resolved after cancel; disposing");
                dispose_adapter(adapter);
                return;
            }
            DetectionLoop::new(adapter, surface, state, cancel)
                .run(streams)
                .await;
        }
        Err(e) => {
            let err = MonitorError::DetectorUnavailable(e.to_string());
            let published = publish_unless_cancelled(&state, &cancel, |s| {
                s.flags.clear();
                s.detector_available = false;
                s.detector_source = None;
                s.is_monitoring = false;
                s.error = Some(err.to_string());
                true
            });
            if published {
                tracing::error!(error = %err, "monitoring could not start");
            }
        }
    }
}

/// Keeps at most one monitor running, tied to the active session.
pub struct MonitorController {
    resolver: Arc<DetectorResolver>,
    state: StatePublisher,
    active: Option<Monitor>,
}

impl MonitorController {
    pub fn new(resolver: Arc<DetectorResolver>) -> Self {
        let (state, _) = watch::channel(MonitorState::default());
        Self {
            resolver,
            state: Arc::new(state),
            active: None,
        }
    }

    pub fn resolver(&self) -> &DetectorResolver {
        &self.resolver
    }

    /// Subscribe to published monitoring state.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> MonitorState {
        self.state.borrow().clone()
    }

    pub fn active_session(&self) -> Option<Uuid> {
        self.active.as_ref().map(|m| m.session_id)
    }

    /// React to the active session changing without waiting for the previous
    /// monitor. Same session is a no-op; any other change cancels the current
    /// monitor and starts one for `session`.
    pub fn switch_session(&mut self, session: Option<&VideoSession>) -> PendingStop {
        let unchanged = match (&self.active, session) {
            (Some(m), Some(s)) => m.session_id == s.id(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return PendingStop::default();
        }

        let pending = self.begin_teardown();
        if let Some(session) = session {
            self.active = Some(Monitor::start(
                session,
                Arc::clone(&self.resolver),
                Arc::clone(&self.state),
            ));
        }
        pending
    }

    /// [`switch_session`](Self::switch_session), then wait for the previous
    /// monitor to stop.
    pub async fn set_session(&mut self, session: Option<&VideoSession>) {
        self.switch_session(session).wait().await;
    }

    /// Cancel any running monitor and reset published status.
    pub fn begin_teardown(&mut self) -> PendingStop {
        let monitor = self.active.take();
        if let Some(m) = &monitor {
            m.cancel.cancel();
        }
        self.state.send_if_modified(|s| {
            let changed = !s.flags.is_empty() || s.is_monitoring || s.detector_source.is_some();
            s.flags.clear();
            s.is_monitoring = false;
            s.detector_source = None;
            changed
        });
        PendingStop { monitor }
    }

    /// Stop any running monitor and reset published status.
    pub async fn teardown(&mut self) {
        self.begin_teardown().wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::{backends, leaked_cell, FakeFactory, FakeNative, FakeProbe};
    use crate::adapter::{NativeDetectorOptions, NativeError, NativeFaceDetector, PlatformProbe};
    use crate::binder::tests::FakeStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use tokio::sync::Notify;
    use vigil_core::{DetectionBox, DetectorSource, ModelRuntime, RuntimeStatus};
    use vigil_hw::Frame;

    fn resolver(native: bool, failing: Vec<ModelRuntime>) -> Arc<DetectorResolver> {
        Arc::new(DetectorResolver::new(
            Arc::new(FakeProbe {
                native,
                closed: Arc::new(AtomicUsize::new(0)),
            }),
            leaked_cell(),
            backends(true),
            Arc::new(FakeFactory::new(failing)),
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_session_start_publishes_monitoring_state() {
        let mut controller = MonitorController::new(resolver(true, vec![]));
        let session = VideoSession::new(Some(FakeStream::with_frame("cam-1", 640, 480)));

        controller.set_session(Some(&session)).await;
        settle().await;

        let state = controller.state();
        assert!(state.is_monitoring);
        assert!(state.detector_available);
        assert_eq!(state.detector_source, Some(DetectorSource::Native));
        assert_eq!(controller.active_session(), Some(session.id()));
        assert_eq!(controller.resolver().runtime().status(), RuntimeStatus::Uninitialized);

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_same_session_is_noop() {
        let mut controller = MonitorController::new(resolver(true, vec![]));
        let session = VideoSession::new(None);

        controller.set_session(Some(&session)).await;
        controller.set_session(Some(&session)).await;
        settle().await;
        assert_eq!(session.subscriber_count(), 1);

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_resets_state_and_unsubscribes() {
        let mut controller = MonitorController::new(resolver(true, vec![]));
        let stream = FakeStream::with_frame("cam-1", 640, 480);
        let session = VideoSession::new(Some(stream.clone()));

        controller.set_session(Some(&session)).await;
        settle().await;
        assert_eq!(session.subscriber_count(), 1);

        controller.set_session(None).await;
        let state = controller.state();
        assert!(!state.is_monitoring);
        assert!(state.flags.is_empty());
        assert_eq!(state.detector_source, None);
        assert_eq!(session.subscriber_count(), 0);
        assert!(!stream.playing.load(Ordering::SeqCst));
        assert_eq!(controller.active_session(), None);
    }

    #[tokio::test]
    async fn test_session_change_restarts_monitor() {
        let mut controller = MonitorController::new(resolver(true, vec![]));
        let first = VideoSession::new(None);
        let second = VideoSession::new(None);

        controller.set_session(Some(&first)).await;
        settle().await;
        controller.set_session(Some(&second)).await;
        settle().await;

        assert_eq!(first.subscriber_count(), 0);
        assert_eq!(second.subscriber_count(), 1);
        assert_eq!(controller.active_session(), Some(second.id()));

        controller.teardown().await;
    }

    #[tokio::test]
    async fn test_unavailable_detector_reports_error() {
        let mut controller = MonitorController::new(resolver(false, ModelRuntime::FALLBACK_ORDER.to_vec()));
        let session = VideoSession::new(None);

        controller.set_session(Some(&session)).await;
        settle().await;

        let state = controller.state();
        assert!(!state.is_monitoring);
        assert!(!state.detector_available);
        assert!(state.error.unwrap().starts_with("face detector unavailable"));
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_source_published_without_native() {
        let mut controller = MonitorController::new(resolver(false, vec![ModelRuntime::Accelerated]));
        let session = VideoSession::new(None);

        controller.set_session(Some(&session)).await;
        settle().await;
        assert_eq!(controller.state().detector_source, Some(DetectorSource::Fallback));

        controller.teardown().await;
    }

    /// Native detector whose detect call blocks its thread for `delay`.
    struct StalledNative {
        delay: Duration,
        detecting: Arc<AtomicBool>,
    }

    impl NativeFaceDetector for StalledNative {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>, NativeError> {
            self.detecting.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(Vec::new())
        }
    }

    struct StalledProbe {
        delay: Duration,
        detecting: Arc<AtomicBool>,
    }

    impl PlatformProbe for StalledProbe {
        fn native_detector(&self, _options: NativeDetectorOptions) -> Option<Box<dyn NativeFaceDetector>> {
            Some(Box::new(StalledNative {
                delay: self.delay,
                detecting: Arc::clone(&self.detecting),
            }))
        }
    }

    #[tokio::test]
    async fn test_teardown_bounded_while_detect_is_stalled() {
        let detecting = Arc::new(AtomicBool::new(false));
        let probe = StalledProbe {
            delay: Duration::from_millis(2500),
            detecting: Arc::clone(&detecting),
        };
        let resolver = DetectorResolver::new(
            Arc::new(probe),
            leaked_cell(),
            backends(true),
            Arc::new(FakeFactory::new(vec![])),
        );
        let mut controller = MonitorController::new(Arc::new(resolver));
        let session = VideoSession::new(Some(FakeStream::with_frame("cam-1", 640, 480)));

        controller.set_session(Some(&session)).await;
        for _ in 0..100 {
            if detecting.load(Ordering::SeqCst) {
                break;
            }
            settle().await;
        }
        assert!(detecting.load(Ordering::SeqCst));

        let stopped = tokio::time::timeout(Duration::from_secs(2), controller.teardown()).await;
        assert!(stopped.is_ok());
        let state = controller.state();
        assert!(!state.is_monitoring);
        assert_eq!(state.detector_source, None);
        assert_eq!(controller.active_session(), None);
    }

    /// Probe that parks resolution until the test releases `gate`.
    struct GatedProbe {
        entered: Arc<Notify>,
        gate: Mutex<mpsc::Receiver<()>>,
        closed: Arc<AtomicUsize>,
    }

    impl PlatformProbe for GatedProbe {
        fn native_detector(&self, _options: NativeDetectorOptions) -> Option<Box<dyn NativeFaceDetector>> {
            self.entered.notify_one();
            let _ = self.gate.lock().unwrap().recv();
            Some(Box::new(FakeNative {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn test_detector_resolved_after_teardown_is_disposed() {
        let (release, gate) = mpsc::channel();
        let entered = Arc::new(Notify::new());
        let closed = Arc::new(AtomicUsize::new(0));
        let probe = GatedProbe {
            entered: Arc::clone(&entered),
            gate: Mutex::new(gate),
            closed: Arc::clone(&closed),
        };
        let resolver = DetectorResolver::new(
            Arc::new(probe),
            leaked_cell(),
            backends(true),
            Arc::new(FakeFactory::new(vec![])),
        );
        let mut controller = MonitorController::new(Arc::new(resolver));
        let mut rx = controller.subscribe();
        let session = VideoSession::new(Some(FakeStream::with_frame("cam-1", 640, 480)));

        controller.set_session(Some(&session)).await;
        entered.notified().await;

        let pending = controller.switch_session(None);
        assert!(!pending.is_empty());
        rx.borrow_and_update();
        release.send(()).unwrap();
        pending.wait().await;

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!rx.has_changed().unwrap());
        let state = controller.state();
        assert!(!state.is_monitoring);
        assert_eq!(state.detector_source, None);
        assert!(state.error.is_none());
        assert_eq!(session.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_begin_teardown_resets_state_before_wait() {
        let mut controller = MonitorController::new(resolver(true, vec![]));
        let session = VideoSession::new(Some(FakeStream::with_frame("cam-1", 640, 480)));
        controller.set_session(Some(&session)).await;
        settle().await;
        assert!(controller.state().is_monitoring);

        let pending = controller.begin_teardown();
        assert!(!controller.state().is_monitoring);
        assert_eq!(controller.active_session(), None);
        pending.wait().await;
        assert_eq!(session.subscriber_count(), 0);
    }
}
