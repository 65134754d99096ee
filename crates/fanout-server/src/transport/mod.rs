//! Media transport boundary
//!
//! The relay never touches ICE, DTLS or SRTP itself. It negotiates sessions,
//! reads and writes RTP packets and sends keyframe requests through the traits
//! in this module. [`WebRtcTransport`] implements them on top of webrtc-rs;
//! [`MemoryTransport`] is an in-process implementation that moves packets
//! over channels.

mod memory;
mod rtc;

pub use self::memory::{
    InboundFeed, MemoryInbound, MemoryOutbound, MemoryPublisher, MemorySubscriber, MemoryTransport,
    PublisherControl,
};
pub use self::rtc::{WebRtcInbound, WebRtcOutbound, WebRtcPublisher, WebRtcTransport};

use async_trait::async_trait;
use fanout_protocol::SessionDescription;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Codec negotiated for a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

/// Description of an inbound track, used to build its relay twin
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub kind: MediaKind,
    pub ssrc: u32,
    pub payload_type: u8,
    pub codec: CodecInfo,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Session negotiation failed: {0}")]
    Negotiation(String),

    /// Writing to a track nobody is bound to yet. Expected before the first
    /// subscriber joins.
    #[error("Track has no subscribers")]
    NoSubscribers,

    /// One or more bound subscribers failed to take the packet. The others
    /// still received it.
    #[error("Write to subscriber failed: {0}")]
    SubscriberWrite(String),

    #[error("Track or connection closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Result of accepting a publisher's offer
pub struct PublishSession<P, I> {
    pub answer: SessionDescription,
    pub publisher: P,
    /// Inbound tracks, delivered as they become active
    pub tracks: mpsc::Receiver<I>,
}

/// A media track arriving from the publisher
#[async_trait]
pub trait InboundTrack: Send + Sync + 'static {
    fn info(&self) -> TrackInfo;

    async fn read_packet(&self) -> Result<Packet, TransportError>;
}

/// A relay-owned track that subscriber sessions attach to
#[async_trait]
pub trait OutboundTrack: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError>;
}

/// The publisher's side of a negotiated session
#[async_trait]
pub trait PublisherLink: Send + Sync + 'static {
    /// Ask the publisher's encoder for a keyframe on `media_ssrc`
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), TransportError>;

    /// Resolves once the publisher's connection has closed or failed
    async fn closed(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    type Publisher: PublisherLink;
    type Inbound: InboundTrack;
    type Outbound: OutboundTrack;

    /// Answer a publisher's offer with one receive slot per media kind
    async fn accept_publisher(
        &self,
        offer: SessionDescription,
    ) -> Result<PublishSession<Self::Publisher, Self::Inbound>, TransportError>;

    /// Allocate a relay track with the same codec as `info`, tagged with
    /// `stream_label` rather than the publisher's identifiers
    fn create_outbound_track(
        &self,
        info: &TrackInfo,
        stream_label: &str,
    ) -> Result<Arc<Self::Outbound>, TransportError>;

    /// Negotiate a subscriber session that sends `tracks`
    async fn accept_subscriber(
        &self,
        offer: SessionDescription,
        tracks: Vec<Arc<Self::Outbound>>,
    ) -> Result<SessionDescription, TransportError>;
}
