//! SFU (Selective Forwarding Unit)
//!
//! One publisher per room. Each inbound media kind gets a relay loop that
//! copies RTP packets unmodified into a single relay-owned track, and every
//! subscriber of the room is bound to those same tracks.

mod hub;
mod relay;
mod room;

pub use hub::SfuHub;
pub use room::{Room, RoomId, TrackSlot};

use crate::transport::TransportError;
use fanout_media::RecordingOptions;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SfuSettings {
    /// Period of the PLI ticker on video tracks; zero disables it
    pub keyframe_interval: Duration,
    /// How long a join waits for the room's video track. `None` waits
    /// until the room goes away.
    pub track_wait_timeout: Option<Duration>,
    /// Once video is ready, how long a join still waits for audio. Audio
    /// often arrives just after video; zero attaches only what is there.
    pub audio_wait: Duration,
    /// Stream id given to relay-owned tracks
    pub stream_label: String,
    pub recording: Option<RecordingOptions>,
}

impl Default for SfuSettings {
    fn default() -> Self {
        Self {
            keyframe_interval: Duration::from_secs(3),
            track_wait_timeout: Some(Duration::from_secs(10)),
            audio_wait: Duration::from_millis(500),
            stream_label: "fanout".to_string(),
            recording: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),

    #[error("Room {0} has no video track yet")]
    TrackTimeout(RoomId),

    #[error("SFU hub is not running")]
    HubClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
