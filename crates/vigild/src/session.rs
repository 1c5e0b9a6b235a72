//! Video session: the owner of the local camera stream that monitoring reads.

use tokio::sync::watch;
use uuid::Uuid;
use vigil_hw::SharedStream;

/// A live video session. Its local stream may be replaced or removed at any
/// time; monitors observe those changes through [`VideoSession::subscribe`].
pub struct VideoSession {
    id: Uuid,
    streams: watch::Sender<Option<SharedStream>>,
}

impl VideoSession {
    pub fn new(stream: Option<SharedStream>) -> Self {
        let (streams, _) = watch::channel(stream);
        Self {
            id: Uuid::new_v4(),
            streams,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn current_stream(&self) -> Option<SharedStream> {
        self.streams.borrow().clone()
    }

    /// Swap in a new local stream, returning the previous one.
    pub fn replace_stream(&self, stream: SharedStream) -> Option<SharedStream> {
        tracing::info!(session = %self.id, stream = stream.id(), "local stream replaced");
        self.streams.send_replace(Some(stream))
    }

    pub fn remove_stream(&self) -> Option<SharedStream> {
        tracing::info!(session = %self.id, "local stream removed");
        self.streams.send_replace(None)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SharedStream>> {
        self.streams.subscribe()
    }

    /// Number of live stream-change subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.streams.receiver_count()
    }
}
