//! Live video streams.
//!
//! A [`VideoStream`] is a playable source that keeps its most recent frame
//! available for polling. [`CameraStream`] backs one with a capture thread
//! reading from a V4L2 camera or any other [`FrameSource`].

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("capture worker failed to start: {0}")]
    Worker(String),
}

/// A live frame source.
pub trait VideoStream: Send + Sync {
    /// Stable identity; two handles with the same id are the same stream.
    fn id(&self) -> &str;

    /// Start producing frames. Calling `play` on a playing stream is a no-op.
    fn play(&self) -> Result<(), StreamError>;

    /// Stop producing frames. The last frame stays available.
    fn pause(&self);

    /// Most recent frame, or `None` before the first frame arrives.
    fn latest_frame(&self) -> Option<Frame>;
}

pub type SharedStream = Arc<dyn VideoStream>;

static NEXT_STREAM: AtomicU64 = AtomicU64::new(1);

/// Frame producer driven by a capture thread.
pub trait FrameSource {
    /// Deliver frames to `on_frame` until `stop` is set or capture fails.
    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(Frame)) -> Result<(), CameraError>;
}

impl FrameSource for Camera {
    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(Frame)) -> Result<(), CameraError> {
        self.stream_frames(stop, on_frame)
    }
}

impl<F> FrameSource for F
where
    F: FnMut(&AtomicBool, &mut dyn FnMut(Frame)) -> Result<(), CameraError>,
{
    fn run(&mut self, stop: &AtomicBool, on_frame: &mut dyn FnMut(Frame)) -> Result<(), CameraError> {
        self(stop, on_frame)
    }
}

/// Opens a [`FrameSource`] on the capture thread.
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    /// Cleared by the capture thread when it exits.
    alive: Arc<AtomicBool>,
    /// Joined lazily; pausing never waits on a blocked dequeue.
    _handle: std::thread::JoinHandle<()>,
}

impl CaptureWorker {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Stream with a dedicated capture thread, backed by a V4L2 camera by default.
pub struct CameraStream {
    id: String,
    opener: SourceOpener,
    latest: Arc<Mutex<Option<Frame>>>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl CameraStream {
    /// Create a paused stream for `device_path`. The device is opened on `play`.
    pub fn new(device_path: &str) -> Self {
        let device = device_path.to_string();
        Self::with_source(
            device_path,
            Arc::new(move || Camera::open(&device).map(|c| Box::new(c) as Box<dyn FrameSource>)),
        )
    }

    /// Create a paused stream whose frames come from `opener`.
    pub fn with_source(label: &str, opener: SourceOpener) -> Self {
        let n = NEXT_STREAM.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{label}#{n}"),
            opener,
            latest: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    /// Whether a capture thread is currently delivering frames.
    pub fn is_playing(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(CaptureWorker::is_alive))
            .unwrap_or(false)
    }
}

impl VideoStream for CameraStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn play(&self) -> Result<(), StreamError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| StreamError::Worker("worker lock poisoned".into()))?;
        if worker.as_ref().is_some_and(CaptureWorker::is_alive) {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CameraError>>();
        let opener = Arc::clone(&self.opener);
        let latest = Arc::clone(&self.latest);
        let thread_stop = Arc::clone(&stop);
        let thread_alive = Arc::clone(&alive);
        let stream_id = self.id.clone();

        let handle = std::thread::Builder::new()
            .name("vigil-capture".into())
            .spawn(move || {
                let mut source = match opener() {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        thread_alive.store(false, Ordering::Release);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let result = source.run(&thread_stop, &mut |frame| {
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(frame);
                    }
                });
                match result {
                    Ok(()) => tracing::debug!(stream = %stream_id, "capture stopped"),
                    Err(e) => {
                        // A frozen frame must not outlive the capture that produced it.
                        if let Ok(mut slot) = latest.lock() {
                            *slot = None;
                        }
                        tracing::warn!(stream = %stream_id, error = %e, "capture ended with error");
                    }
                }
                thread_alive.store(false, Ordering::Release);
            })
            .map_err(|e| StreamError::Worker(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| StreamError::Worker("capture thread exited before opening camera".into()))??;

        tracing::info!(stream = %self.id, "camera stream playing");
        *worker = Some(CaptureWorker {
            stop,
            alive,
            _handle: handle,
        });
        Ok(())
    }

    fn pause(&self) {
        let Ok(mut worker) = self.worker.lock() else {
            return;
        };
        if let Some(w) = worker.take() {
            w.stop.store(true, Ordering::Release);
            tracing::info!(stream = %self.id, "camera stream paused");
        }
    }

    fn latest_frame(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|f| f.clone())
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.pause();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stream_ids_are_unique_per_handle() {
        let a = CameraStream::new("/dev/video0");
        let b = CameraStream::new("/dev/video0");
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("/dev/video0#"));
    }

    #[test]
    fn test_new_stream_has_no_frame() {
        let s = CameraStream::new("/dev/video0");
        assert!(s.latest_frame().is_none());
        assert!(!s.is_playing());
    }

    #[test]
    fn test_play_missing_device_fails_and_stays_paused() {
        let s = CameraStream::new("/dev/vigil-test-missing");
        let err = s.play().err();
        assert!(matches!(err, Some(StreamError::Camera(CameraError::DeviceNotFound(_)))));
        assert!(!s.is_playing());
    }

    #[test]
    fn test_pause_when_not_playing_is_noop() {
        let s = CameraStream::new("/dev/video0");
        s.pause();
        assert!(!s.is_playing());
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn from_fn<F>(f: F) -> Box<dyn FrameSource>
    where
        F: FnMut(&AtomicBool, &mut dyn FnMut(Frame)) -> Result<(), CameraError> + 'static,
    {
        Box::new(f)
    }

    /// Source that delivers one frame, then fails once `fail` is set.
    fn failing_source(fail: Arc<AtomicBool>) -> SourceOpener {
        Arc::new(move || {
            let fail = Arc::clone(&fail);
            Ok(from_fn(move |stop, on_frame| {
                on_frame(Frame::new(vec![128; 16], 4, 4, 1));
                while !stop.load(Ordering::Acquire) {
                    if fail.load(Ordering::Acquire) {
                        return Err(CameraError::CaptureFailed("device unplugged".into()));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }))
        })
    }

    #[test]
    fn test_capture_error_drops_stale_frame() {
        let fail = Arc::new(AtomicBool::new(false));
        let s = CameraStream::with_source("fake", failing_source(Arc::clone(&fail)));

        s.play().unwrap();
        assert!(wait_until(|| s.latest_frame().is_some()));
        assert!(s.is_playing());

        fail.store(true, Ordering::Release);
        assert!(wait_until(|| !s.is_playing()));
        assert!(s.latest_frame().is_none());
    }

    #[test]
    fn test_play_restarts_after_capture_error() {
        let fail = Arc::new(AtomicBool::new(true));
        let s = CameraStream::with_source("fake", failing_source(Arc::clone(&fail)));

        s.play().unwrap();
        assert!(wait_until(|| !s.is_playing()));

        fail.store(false, Ordering::Release);
        s.play().unwrap();
        assert!(wait_until(|| s.latest_frame().is_some()));
        assert!(s.is_playing());
        s.pause();
    }

    #[test]
    fn test_clean_pause_keeps_last_frame() {
        let s = CameraStream::with_source("fake", failing_source(Arc::new(AtomicBool::new(false))));
        s.play().unwrap();
        assert!(wait_until(|| s.latest_frame().is_some()));

        s.pause();
        assert!(!s.is_playing());
        std::thread::sleep(Duration::from_millis(20));
        assert!(s.latest_frame().is_some());
    }
}
