//! Codec identification and RTP depacketization
//!
//! Depacketizers come from the webrtc-rs `rtp` crate; this module only picks
//! the right one for a negotiated MIME type.

use bytes::Bytes;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packetizer::Depacketizer;

/// Video codecs that can be recorded to IVF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    VP8,
    H264,
}

impl VideoCodec {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        if mime_type.eq_ignore_ascii_case("video/VP8") {
            Some(VideoCodec::VP8)
        } else if mime_type.eq_ignore_ascii_case("video/H264") {
            Some(VideoCodec::H264)
        } else {
            None
        }
    }

    /// IVF codec tag
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            VideoCodec::VP8 => *b"VP80",
            VideoCodec::H264 => *b"H264",
        }
    }

    pub(crate) fn depacketizer(self) -> FrameDepacketizer {
        match self {
            VideoCodec::VP8 => FrameDepacketizer::Vp8(Vp8Packet::default()),
            VideoCodec::H264 => FrameDepacketizer::H264(H264Packet::default()),
        }
    }
}

/// Audio codecs that can be recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
}

impl AudioCodec {
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        mime_type
            .eq_ignore_ascii_case("audio/opus")
            .then_some(AudioCodec::Opus)
    }
}

/// Per-writer depacketizer state
#[derive(Debug)]
pub(crate) enum FrameDepacketizer {
    Vp8(Vp8Packet),
    H264(H264Packet),
    Opus(OpusPacket),
}

impl FrameDepacketizer {
    pub(crate) fn opus() -> Self {
        FrameDepacketizer::Opus(OpusPacket::default())
    }

    pub(crate) fn depacketize(&mut self, payload: &Bytes) -> Result<Bytes, webrtc::rtp::Error> {
        match self {
            FrameDepacketizer::Vp8(p) => p.depacketize(payload),
            FrameDepacketizer::H264(p) => p.depacketize(payload),
            FrameDepacketizer::Opus(p) => p.depacketize(payload),
        }
    }
}
