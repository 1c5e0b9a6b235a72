//! Frame source binder.
//!
//! Keeps the detection loop's frame surface bound to the session's current
//! local stream, and reports whether a usable frame is available.

use vigil_hw::{Frame, SharedStream};

/// What [`FrameSurface::attach`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Same stream already bound; nothing changed.
    Unchanged,
    /// Bound to a different stream and playback was requested.
    Rebound,
    /// The stream went away; playback paused and the binding cleared.
    Cleared,
}

/// The surface frames are read from.
#[derive(Default)]
pub struct FrameSurface {
    bound: Option<SharedStream>,
}

impl FrameSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to `stream`, or clear the binding when it is `None`.
    ///
    /// Playback failures are logged and swallowed.
    pub async fn attach(&mut self, stream: Option<SharedStream>) -> AttachOutcome {
        let Some(stream) = stream else {
            return match self.bound.take() {
                Some(old) => {
                    old.pause();
                    tracing::debug!(stream = old.id(), "frame surface cleared");
                    AttachOutcome::Cleared
                }
                None => AttachOutcome::Unchanged,
            };
        };

        if self.bound.as_ref().is_some_and(|b| b.id() == stream.id()) {
            return AttachOutcome::Unchanged;
        }

        self.bound = Some(stream.clone());
        tracing::debug!(stream = stream.id(), "frame surface bound");

        let playing = stream.clone();
        match tokio::task::spawn_blocking(move || playing.play()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(stream = stream.id(), error = %e, "playback did not start")
            }
            Err(e) => tracing::debug!(stream = stream.id(), error = %e, "playback task failed"),
        }
        AttachOutcome::Rebound
    }

    /// Whether any stream is bound.
    pub fn has_input(&self) -> bool {
        self.bound.is_some()
    }

    /// Id of the bound stream.
    pub fn bound_id(&self) -> Option<&str> {
        self.bound.as_deref().map(|s| s.id())
    }

    /// Latest frame with non-zero dimensions, if any.
    pub fn current_frame(&self) -> Option<Frame> {
        self.bound
            .as_ref()
            .and_then(|s| s.latest_frame())
            .filter(Frame::has_dimensions)
    }

    /// Pause playback and drop the binding.
    pub fn release(&mut self) {
        if let Some(stream) = self.bound.take() {
            stream.pause();
        }
    }
}
