//! Recording of relayed media for fanout
//!
//! This crate turns a stream of RTP packets into files on disk:
//! - VP8 / H.264 video into IVF ([`ivf::IvfWriter`])
//! - Opus audio into Ogg ([`ogg::OggWriter`])
//!
//! Packets reach the writers through a [`recorder::Recorder`], which puts a
//! lossy drop-oldest queue between the relay and the file so a slow disk can
//! never stall forwarding.

pub mod codec;
pub mod ivf;
pub mod ogg;
pub mod queue;
pub mod recorder;
pub mod writer;

pub use codec::{AudioCodec, VideoCodec};
pub use ivf::{IvfHeader, IvfWriter};
pub use ogg::{OggHeader, OggWriter};
pub use queue::DropOldestQueue;
pub use recorder::{Recorder, RecordingOptions};
pub use writer::{MediaWriter, RecordingError};
