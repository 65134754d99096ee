use crate::transport::{MediaKind, MediaTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Room identifier, assigned from a counter by the hub
pub type RoomId = u64;

/// Holds a shared outbound track that is set at most once.
///
/// Readers either take the current value or wait for it to appear.
pub struct TrackSlot<O> {
    track: watch::Sender<Option<Arc<O>>>,
}

impl<O> TrackSlot<O> {
    pub fn new() -> Self {
        let (track, _) = watch::channel(None);
        Self { track }
    }

    /// Install the track. Returns false, leaving the slot untouched, if a
    /// track was installed before.
    pub fn install(&self, track: Arc<O>) -> bool {
        let mut track = Some(track);
        self.track.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = track.take();
            true
        })
    }

    pub fn get(&self) -> Option<Arc<O>> {
        self.track.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.track.borrow().is_some()
    }

    /// Wait for the track, giving up after `timeout` if one is given
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<Arc<O>> {
        let mut rx = self.track.subscribe();
        let ready = async move {
            rx.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|track| track.clone())
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, ready).await.ok().flatten(),
            None => ready.await,
        }
    }
}

impl<O> Default for TrackSlot<O> {
    fn default() -> Self {
        Self::new()
    }
}

/// A publishing session and the relay tracks built from it
pub struct Room<T: MediaTransport> {
    id: RoomId,
    publisher: T::Publisher,
    video: TrackSlot<T::Outbound>,
    audio: TrackSlot<T::Outbound>,
}

impl<T: MediaTransport> Room<T> {
    pub fn new(id: RoomId, publisher: T::Publisher) -> Self {
        Self {
            id,
            publisher,
            video: TrackSlot::new(),
            audio: TrackSlot::new(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn publisher(&self) -> &T::Publisher {
        &self.publisher
    }

    pub fn video(&self) -> &TrackSlot<T::Outbound> {
        &self.video
    }

    pub fn audio(&self) -> &TrackSlot<T::Outbound> {
        &self.audio
    }

    pub fn slot(&self, kind: MediaKind) -> &TrackSlot<T::Outbound> {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }
}
