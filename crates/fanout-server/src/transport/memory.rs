//! In-process transport backed by tokio channels
//!
//! Sessions are "negotiated" by checking that the offer is non-empty. The
//! test side of each session is handed out through `take_publisher` and
//! `take_subscriber`, in the order sessions were accepted.

use super::{
    CodecInfo, InboundTrack, MediaKind, MediaTransport, OutboundTrack, PublishSession,
    PublisherLink, TrackInfo, TransportError,
};
use async_trait::async_trait;
use fanout_protocol::SessionDescription;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use webrtc::rtp::packet::Packet;

const MEMORY_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=fanout-memory\r\nt=0 0\r\n";
const FEED_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_offer(offer: &SessionDescription) -> Result<(), TransportError> {
    if offer.sdp.trim().is_empty() {
        return Err(TransportError::Negotiation("offer has no SDP".to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryTransport {
    publishers: Mutex<VecDeque<PublisherControl>>,
    subscribers: Mutex<VecDeque<MemorySubscriber>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controls for the oldest accepted publisher not yet taken
    pub fn take_publisher(&self) -> Option<PublisherControl> {
        lock(&self.publishers).pop_front()
    }

    /// Receiving end of the oldest accepted subscriber not yet taken
    pub fn take_subscriber(&self) -> Option<MemorySubscriber> {
        lock(&self.subscribers).pop_front()
    }
}

#[async_trait]
impl MediaTransport for MemoryTransport {
    type Publisher = MemoryPublisher;
    type Inbound = MemoryInbound;
    type Outbound = MemoryOutbound;

    async fn accept_publisher(
        &self,
        offer: SessionDescription,
    ) -> Result<PublishSession<MemoryPublisher, MemoryInbound>, TransportError> {
        check_offer(&offer)?;

        let (track_tx, track_rx) = mpsc::channel(FEED_CAPACITY);
        let (keyframe_tx, keyframe_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let reject_keyframes = Arc::new(AtomicBool::new(false));

        lock(&self.publishers).push_back(PublisherControl {
            tracks: track_tx,
            keyframes: keyframe_rx,
            closed: closed_tx.clone(),
            reject_keyframes: reject_keyframes.clone(),
        });

        Ok(PublishSession {
            answer: SessionDescription::answer(MEMORY_ANSWER),
            publisher: MemoryPublisher {
                keyframes: keyframe_tx,
                reject_keyframes,
                closed_tx,
                closed: closed_rx,
            },
            tracks: track_rx,
        })
    }

    fn create_outbound_track(
        &self,
        info: &TrackInfo,
        stream_label: &str,
    ) -> Result<Arc<MemoryOutbound>, TransportError> {
        Ok(Arc::new(MemoryOutbound {
            id: info.kind.to_string(),
            stream_label: stream_label.to_string(),
            kind: info.kind,
            codec: info.codec.clone(),
            bindings: Mutex::new(Vec::new()),
        }))
    }

    async fn accept_subscriber(
        &self,
        offer: SessionDescription,
        tracks: Vec<Arc<MemoryOutbound>>,
    ) -> Result<SessionDescription, TransportError> {
        check_offer(&offer)?;

        let failing = Arc::new(AtomicBool::new(false));
        let receivers = tracks
            .iter()
            .map(|track| track.bind(failing.clone()))
            .collect();
        lock(&self.subscribers).push_back(MemorySubscriber {
            tracks,
            receivers,
            failing,
        });

        Ok(SessionDescription::answer(MEMORY_ANSWER))
    }
}

/// The publisher as seen by the relay
pub struct MemoryPublisher {
    keyframes: mpsc::UnboundedSender<u32>,
    reject_keyframes: Arc<AtomicBool>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl PublisherLink for MemoryPublisher {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), TransportError> {
        if self.reject_keyframes.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.keyframes
            .send(media_ssrc)
            .map_err(|_| TransportError::Closed)
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

/// The publisher as seen by a test: adds tracks, observes keyframe requests,
/// hangs up
pub struct PublisherControl {
    tracks: mpsc::Sender<MemoryInbound>,
    keyframes: mpsc::UnboundedReceiver<u32>,
    closed: Arc<watch::Sender<bool>>,
    reject_keyframes: Arc<AtomicBool>,
}

impl PublisherControl {
    /// Start sending a track; the relay sees it through the session's track
    /// channel
    pub async fn add_track(
        &self,
        kind: MediaKind,
        ssrc: u32,
        mime_type: &str,
    ) -> Result<InboundFeed, TransportError> {
        let (clock_rate, channels) = match kind {
            MediaKind::Audio => (48000, 2),
            MediaKind::Video => (90000, 0),
        };
        let info = TrackInfo {
            kind,
            ssrc,
            payload_type: match kind {
                MediaKind::Audio => 111,
                MediaKind::Video => 96,
            },
            codec: CodecInfo {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                sdp_fmtp_line: String::new(),
            },
        };

        let (sender, receiver) = mpsc::channel(FEED_CAPACITY);
        let inbound = MemoryInbound {
            info,
            packets: tokio::sync::Mutex::new(receiver),
        };
        self.tracks
            .send(inbound)
            .await
            .map_err(|_| TransportError::Closed)?;

        Ok(InboundFeed { sender })
    }

    /// Next keyframe request (media SSRC) sent by the relay
    pub async fn next_keyframe_request(&mut self) -> Option<u32> {
        self.keyframes.recv().await
    }

    pub fn try_keyframe_request(&mut self) -> Option<u32> {
        self.keyframes.try_recv().ok()
    }

    /// While set, keyframe requests fail instead of reaching this side
    pub fn reject_keyframe_requests(&self, reject: bool) {
        self.reject_keyframes.store(reject, Ordering::Relaxed);
    }

    /// Simulate the publisher's connection going away
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Packet source for one published track. Dropping it ends the track.
pub struct InboundFeed {
    sender: mpsc::Sender<Packet>,
}

impl InboundFeed {
    pub async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        self.sender
            .send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

pub struct MemoryInbound {
    info: TrackInfo,
    packets: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

#[async_trait]
impl InboundTrack for MemoryInbound {
    fn info(&self) -> TrackInfo {
        self.info.clone()
    }

    async fn read_packet(&self) -> Result<Packet, TransportError> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

struct Binding {
    packets: mpsc::UnboundedSender<Packet>,
    failing: Arc<AtomicBool>,
}

/// Relay track that copies each packet to every bound subscriber
pub struct MemoryOutbound {
    id: String,
    stream_label: String,
    kind: MediaKind,
    codec: CodecInfo,
    bindings: Mutex<Vec<Binding>>,
}

impl MemoryOutbound {
    pub fn stream_label(&self) -> &str {
        &self.stream_label
    }

    pub fn codec(&self) -> &CodecInfo {
        &self.codec
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.bindings).len()
    }

    fn bind(&self, failing: Arc<AtomicBool>) -> mpsc::UnboundedReceiver<Packet> {
        let (packets, receiver) = mpsc::unbounded_channel();
        lock(&self.bindings).push(Binding { packets, failing });
        receiver
    }
}

#[async_trait]
impl OutboundTrack for MemoryOutbound {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        let mut bindings = lock(&self.bindings);
        // Dropped receivers count as unbound
        bindings.retain(|binding| !binding.packets.is_closed());
        if bindings.is_empty() {
            return Err(TransportError::NoSubscribers);
        }

        let mut failed = 0;
        for binding in bindings.iter() {
            if binding.failing.load(Ordering::Relaxed)
                || binding.packets.send(packet.clone()).is_err()
            {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(TransportError::SubscriberWrite(format!(
                "{} of {} subscribers",
                failed,
                bindings.len()
            )));
        }
        Ok(())
    }
}

/// A negotiated subscriber: the tracks it was bound to and one receiver per
/// track, in the same order
pub struct MemorySubscriber {
    pub tracks: Vec<Arc<MemoryOutbound>>,
    pub receivers: Vec<mpsc::UnboundedReceiver<Packet>>,
    failing: Arc<AtomicBool>,
}

impl MemorySubscriber {
    /// Make every write to this subscriber fail while it stays bound, like a
    /// peer whose transport died before its connection was torn down
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::Relaxed);
    }
}
