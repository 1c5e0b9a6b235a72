//! Periodic detection loop.
//!
//! One task owns the adapter, the frame surface and the flag engine. Ticks are
//! self-scheduling: the next tick is armed only after the current one has
//! finished, so at most one detection call is in flight. Stream changes are
//! applied between ticks.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use vigil_core::{DetectionSnapshot, FlagEngine, MonitorState};
use vigil_hw::SharedStream;

use crate::adapter::DetectionAdapter;
use crate::binder::FrameSurface;
use crate::monitor::MonitorError;

/// Delay between the end of one tick and the start of the next.
pub const POLL_INTERVAL: Duration = Duration::from_millis(750);

pub type StatePublisher = Arc<watch::Sender<MonitorState>>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag. Once set it stays set.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the check so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Apply `update` to the published state unless `cancel` is set.
///
/// The flag is checked under the channel's write lock, so once `cancel()` has
/// returned a cancelled run can no longer change what subscribers see.
pub fn publish_unless_cancelled(
    state: &StatePublisher,
    cancel: &CancelFlag,
    update: impl FnOnce(&mut MonitorState) -> bool,
) -> bool {
    state.send_if_modified(|s| !cancel.is_cancelled() && update(s))
}

/// Dispose an adapter, logging instead of propagating failures.
pub fn dispose_adapter(mut adapter: Box<dyn DetectionAdapter>) {
    if let Err(e) = adapter.dispose() {
        tracing::warn!(source = %adapter.source(), error = %e, "detector dispose failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Reschedule,
    Stop,
}

pub struct DetectionLoop {
    adapter: Option<Box<dyn DetectionAdapter>>,
    surface: FrameSurface,
    engine: FlagEngine,
    state: StatePublisher,
    cancel: CancelFlag,
    phase: LoopPhase,
}

impl DetectionLoop {
    pub fn new(
        adapter: Box<dyn DetectionAdapter>,
        surface: FrameSurface,
        state: StatePublisher,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            adapter: Some(adapter),
            surface,
            engine: FlagEngine::new(),
            state,
            cancel,
            phase: LoopPhase::Starting,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn engine(&self) -> &FlagEngine {
        &self.engine
    }

    pub fn surface_mut(&mut self) -> &mut FrameSurface {
        &mut self.surface
    }

    /// Run one detection pass at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if self.cancel.is_cancelled() {
            return TickOutcome::Stop;
        }
        let Some(adapter) = self.adapter.as_mut() else {
            return TickOutcome::Stop;
        };

        if !self.surface.has_input() {
            if self.engine.reset() {
                self.publish_flags();
            }
            return TickOutcome::Reschedule;
        }

        let Some(frame) = self.surface.current_frame() else {
            return TickOutcome::Reschedule;
        };

        let result = adapter.detect(&frame).await;
        if self.cancel.is_cancelled() {
            return TickOutcome::Stop;
        }

        match result {
            Ok(boxes) => {
                let snapshot = DetectionSnapshot::from_boxes(boxes);
                if self.engine.evaluate(&snapshot, frame.width, frame.height, now) {
                    self.publish_flags();
                }
                TickOutcome::Reschedule
            }
            Err(e) => {
                let failure = MonitorError::DetectionFailure(e.to_string());
                tracing::error!(error = %failure, "face detection failed; stopping monitor");
                self.engine.reset();
                publish_unless_cancelled(&self.state, &self.cancel, |s| {
                    s.flags.clear();
                    s.detector_available = false;
                    s.detector_source = None;
                    s.is_monitoring = false;
                    s.error = Some(failure.to_string());
                    true
                });
                TickOutcome::Stop
            }
        }
    }

    /// Bind the initial stream and enter [`LoopPhase::Running`]. Returns
    /// `false` when the run was cancelled while binding.
    pub async fn start(&mut self, streams: &mut watch::Receiver<Option<SharedStream>>) -> bool {
        let initial = streams.borrow_and_update().clone();
        self.surface.attach(initial).await;
        if self.cancel.is_cancelled() {
            return false;
        }
        self.phase = LoopPhase::Running;
        tracing::debug!("detection loop running");
        true
    }

    /// Drive the loop until cancelled or a tick stops it.
    pub async fn run(mut self, mut streams: watch::Receiver<Option<SharedStream>>) {
        if self.start(&mut streams).await {
            self.poll(&mut streams).await;
        }
        self.shutdown();
    }

    async fn poll(&mut self, streams: &mut watch::Receiver<Option<SharedStream>>) {
        let mut session_open = true;
        let mut next_tick = Instant::now();
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = next_stream_change(streams, session_open) => {
                    let stream = match changed {
                        Ok(()) => streams.borrow_and_update().clone(),
                        Err(_) => {
                            session_open = false;
                            None
                        }
                    };
                    self.surface.attach(stream).await;
                    if self.cancel.is_cancelled() {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(next_tick) => {
                    match self.tick(Utc::now()).await {
                        TickOutcome::Reschedule => next_tick = Instant::now() + POLL_INTERVAL,
                        TickOutcome::Stop => return,
                    }
                }
            }
        }
    }

    fn publish_flags(&self) {
        let flags = self.engine.flags().to_vec();
        publish_unless_cancelled(&self.state, &self.cancel, |s| {
            if s.flags == flags {
                false
            } else {
                s.flags = flags;
                true
            }
        });
    }

    /// Release the stream and dispose the adapter. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.phase = LoopPhase::Stopped;
        self.engine.reset();
        self.surface.release();
        if let Some(adapter) = self.adapter.take() {
            dispose_adapter(adapter);
            tracing::debug!("detection loop stopped");
        }
    }
}

async fn next_stream_change(
    streams: &mut watch::Receiver<Option<SharedStream>>,
    session_open: bool,
) -> Result<(), watch::error::RecvError> {
    if !session_open {
        std::future::pending::<()>().await;
    }
    streams.changed().await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapter::AdapterError;
    use crate::binder::tests::FakeStream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use vigil_core::{DetectionBox, DetectorSource, FlagType};
    use vigil_hw::Frame;

    pub(crate) type Script = Arc<Mutex<VecDeque<Result<Vec<DetectionBox>, String>>>>;

    /// Adapter replaying scripted results; an empty script yields no faces.
    pub(crate) struct ScriptedAdapter {
        pub script: Script,
        pub calls: Arc<AtomicUsize>,
        pub disposed: Arc<AtomicUsize>,
    }

    impl ScriptedAdapter {
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                calls: Arc::new(AtomicUsize::new(0)),
                disposed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl DetectionAdapter for ScriptedAdapter {
        fn source(&self) -> DetectorSource {
            DetectorSource::Fallback
        }

        async fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(boxes)) => Ok(boxes),
                Some(Err(msg)) => Err(AdapterError::Worker(msg)),
                None => Ok(Vec::new()),
            }
        }

        fn dispose(&mut self) -> Result<(), AdapterError> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Adapter whose detect call parks until `gate` is notified.
    struct GatedAdapter {
        entered: Arc<Notify>,
        gate: Arc<Notify>,
        boxes: Vec<DetectionBox>,
    }

    #[async_trait]
    impl DetectionAdapter for GatedAdapter {
        fn source(&self) -> DetectorSource {
            DetectorSource::Native
        }

        async fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectionBox>, AdapterError> {
            self.entered.notify_one();
            self.gate.notified().await;
            Ok(self.boxes.clone())
        }
    }

    fn centered() -> DetectionBox {
        DetectionBox::new(400.0, 200.0, 200.0, 100.0)
    }

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn publisher() -> (StatePublisher, watch::Receiver<MonitorState>) {
        let (tx, rx) = watch::channel(MonitorState::default());
        (Arc::new(tx), rx)
    }

    async fn bound_loop(
        adapter: impl DetectionAdapter + 'static,
    ) -> (DetectionLoop, watch::Receiver<MonitorState>, Arc<FakeStream>) {
        let (state, rx) = publisher();
        let stream = FakeStream::with_frame("cam-1", 1000, 500);
        let mut surface = FrameSurface::new();
        surface.attach(Some(stream.clone())).await;
        let lp = DetectionLoop::new(Box::new(adapter), surface, state, CancelFlag::new());
        (lp, rx, stream)
    }

    #[tokio::test]
    async fn test_tick_without_stream_resets_timers() {
        let (state, _rx) = publisher();
        let mut lp = DetectionLoop::new(Box::new(ScriptedAdapter::new()), FrameSurface::new(), state, CancelFlag::new());

        assert_eq!(lp.tick(t(0)).await, TickOutcome::Reschedule);
        assert!(lp.engine().timers().no_face_since.is_none());
    }

    #[tokio::test]
    async fn test_tick_without_frame_skips_detection() {
        let adapter = ScriptedAdapter::new();
        let calls = adapter.calls.clone();
        let (state, _rx) = publisher();
        let mut surface = FrameSurface::new();
        surface.attach(Some(FakeStream::new("cam-1"))).await;
        let mut lp = DetectionLoop::new(Box::new(adapter), surface, state, CancelFlag::new());

        assert_eq!(lp.tick(t(0)).await, TickOutcome::Reschedule);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_face_flag_published_after_threshold() {
        let (mut lp, rx, _stream) = bound_loop(ScriptedAdapter::new()).await;

        lp.tick(t(0)).await;
        lp.tick(t(1500)).await;
        assert!(rx.borrow().flags.is_empty());

        lp.tick(t(3000)).await;
        assert_eq!(rx.borrow().flag_types(), vec![FlagType::NoFace]);
        assert_eq!(rx.borrow().flags[0].since, t(0));
    }

    #[tokio::test]
    async fn test_stream_loss_clears_flags() {
        let (mut lp, rx, _stream) = bound_loop(ScriptedAdapter::new()).await;
        lp.tick(t(0)).await;
        lp.tick(t(3000)).await;
        assert_eq!(rx.borrow().flag_types(), vec![FlagType::NoFace]);

        lp.surface_mut().attach(None).await;
        lp.tick(t(3750)).await;
        assert!(rx.borrow().flags.is_empty());
        assert!(lp.engine().timers().no_face_since.is_none());
    }

    #[tokio::test]
    async fn test_detection_failure_stops_and_reports() {
        let adapter = ScriptedAdapter::new();
        adapter.script.lock().unwrap().push_back(Ok(vec![centered(), centered()]));
        adapter.script.lock().unwrap().push_back(Err("session lost".into()));
        let (mut lp, rx, _stream) = bound_loop(adapter).await;

        assert_eq!(lp.tick(t(0)).await, TickOutcome::Reschedule);
        assert_eq!(rx.borrow().flag_types(), vec![FlagType::MultipleFaces]);

        assert_eq!(lp.tick(t(750)).await, TickOutcome::Stop);
        let state = rx.borrow().clone();
        assert!(state.flags.is_empty());
        assert!(!state.detector_available);
        assert!(!state.is_monitoring);
        assert_eq!(state.detector_source, None);
        assert!(state.error.unwrap().contains("session lost"));
    }

    #[tokio::test]
    async fn test_cancelled_tick_does_not_detect() {
        let adapter = ScriptedAdapter::new();
        let calls = adapter.calls.clone();
        let (mut lp, _rx, _stream) = bound_loop(adapter).await;

        lp.cancel.cancel();
        assert_eq!(lp.tick(t(0)).await, TickOutcome::Stop);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_detect_discards_result() {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let adapter = GatedAdapter {
            entered: entered.clone(),
            gate: gate.clone(),
            boxes: vec![centered(), centered()],
        };
        let (mut lp, mut rx, _stream) = bound_loop(adapter).await;
        rx.borrow_and_update();
        let cancel = lp.cancel.clone();

        let task = tokio::spawn(async move {
            let outcome = lp.tick(t(0)).await;
            (outcome, lp)
        });
        entered.notified().await;
        cancel.cancel();
        gate.notify_one();

        let (outcome, lp) = task.await.unwrap();
        assert_eq!(outcome, TickOutcome::Stop);
        assert!(!rx.has_changed().unwrap());
        assert!(rx.borrow().flags.is_empty());
        assert!(lp.engine().flags().is_empty());
        assert!(lp.engine().timers().no_face_since.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_run_cannot_publish() {
        let adapter = ScriptedAdapter::new();
        adapter.script.lock().unwrap().push_back(Err("session lost".into()));
        let (mut lp, mut rx, _stream) = bound_loop(adapter).await;
        rx.borrow_and_update();

        lp.cancel.cancel();
        let changed = publish_unless_cancelled(&lp.state, &lp.cancel, |s| {
            s.is_monitoring = true;
            true
        });
        assert!(!changed);
        assert_eq!(lp.tick(t(0)).await, TickOutcome::Stop);
        assert!(!rx.has_changed().unwrap());
        assert!(rx.borrow().error.is_none());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_phases() {
        let adapter = ScriptedAdapter::new();
        let disposed = adapter.disposed.clone();
        let (state, _rx) = publisher();
        let stream = FakeStream::with_frame("cam-1", 640, 480);
        let (_tx, mut streams) = watch::channel::<Option<SharedStream>>(Some(stream.clone()));
        let mut lp = DetectionLoop::new(Box::new(adapter), FrameSurface::new(), state, CancelFlag::new());
        assert_eq!(lp.phase(), LoopPhase::Starting);

        assert!(lp.start(&mut streams).await);
        assert_eq!(lp.phase(), LoopPhase::Running);
        assert!(stream.playing.load(Ordering::SeqCst));

        lp.shutdown();
        lp.shutdown();
        assert_eq!(lp.phase(), LoopPhase::Stopped);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!stream.playing.load(Ordering::SeqCst));
        assert_eq!(lp.tick(t(0)).await, TickOutcome::Stop);
    }

    #[tokio::test]
    async fn test_start_cancelled_while_binding_stays_starting() {
        let cancel = CancelFlag::new();
        let (state, _rx) = publisher();
        let (_tx, mut streams) = watch::channel::<Option<SharedStream>>(Some(FakeStream::new("cam-1")));
        let mut lp = DetectionLoop::new(Box::new(ScriptedAdapter::new()), FrameSurface::new(), state, cancel.clone());

        cancel.cancel();
        assert!(!lp.start(&mut streams).await);
        assert_eq!(lp.phase(), LoopPhase::Starting);
    }

    #[tokio::test]
    async fn test_unchanged_flags_do_not_republish() {
        let adapter = ScriptedAdapter::new();
        for _ in 0..3 {
            adapter.script.lock().unwrap().push_back(Ok(vec![centered(), centered()]));
        }
        let (mut lp, mut rx, _stream) = bound_loop(adapter).await;
        rx.borrow_and_update();

        lp.tick(t(0)).await;
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        lp.tick(t(750)).await;
        lp.tick(t(1500)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_immediately_and_stops_on_cancel() {
        let adapter = ScriptedAdapter::new();
        let calls = adapter.calls.clone();
        let disposed = adapter.disposed.clone();
        let (state, _rx) = publisher();
        let cancel = CancelFlag::new();
        let stream = FakeStream::with_frame("cam-1", 640, 480);
        let (tx, streams) = watch::channel::<Option<SharedStream>>(Some(stream.clone()));

        let lp = DetectionLoop::new(Box::new(adapter), FrameSurface::new(), state, cancel.clone());
        let task = tokio::spawn(lp.run(streams));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(POLL_INTERVAL).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(tx.receiver_count(), 0);
        assert!(!stream.playing.load(Ordering::SeqCst));

        tokio::time::sleep(POLL_INTERVAL * 4).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_follows_stream_replacement() {
        let (state, _rx) = publisher();
        let first = FakeStream::with_frame("cam-1", 640, 480);
        let second = FakeStream::with_frame("cam-2", 640, 480);
        let (tx, streams) = watch::channel::<Option<SharedStream>>(Some(first.clone()));
        let cancel = CancelFlag::new();

        let lp = DetectionLoop::new(Box::new(ScriptedAdapter::new()), FrameSurface::new(), state, cancel.clone());
        let task = tokio::spawn(lp.run(streams));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(first.playing.load(Ordering::SeqCst));

        tx.send_replace(Some(second.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(second.playing.load(Ordering::SeqCst));
        assert_eq!(second.plays.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
