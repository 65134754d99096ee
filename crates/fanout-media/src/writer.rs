use thiserror::Error;
use webrtc::rtp::packet::Packet;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Depacketization failed: {0}")]
    Depacketize(#[from] webrtc::rtp::Error),

    #[error("Writer failed earlier and no longer accepts packets")]
    Poisoned,

    #[error("Writer is closed")]
    Closed,

    #[error("Packet of {0} bytes does not fit in a single page")]
    PacketTooLarge(usize),
}

/// A container that consumes RTP packets and persists their media.
///
/// `close` must be idempotent: the second and later calls return `Ok(())`
/// without touching the output.
pub trait MediaWriter: Send {
    fn write_rtp(&mut self, packet: &Packet) -> Result<(), RecordingError>;

    fn close(&mut self) -> Result<(), RecordingError>;
}
