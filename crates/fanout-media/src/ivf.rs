//! IVF video container writer
//!
//! Layout (all multi-byte fields little-endian):
//!
//! ```text
//! bytes 0-3    signature 'DKIF'
//! bytes 4-5    version (0)
//! bytes 6-7    header length (32)
//! bytes 8-11   codec FourCC
//! bytes 12-13  width
//! bytes 14-15  height
//! bytes 16-19  frame rate numerator
//! bytes 20-23  frame rate denominator (time scale)
//! bytes 24-27  frame count, patched on close
//! bytes 28-31  reserved
//! ```
//!
//! Each frame record is a 12-byte header (u32 frame length, u64 presentation
//! index) followed by the frame bytes.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use webrtc::rtp::packet::Packet;

use crate::codec::{FrameDepacketizer, VideoCodec};
use crate::writer::{MediaWriter, RecordingError};

pub const IVF_SIGNATURE: &[u8; 4] = b"DKIF";
pub const IVF_HEADER_LEN: usize = 32;
pub const IVF_FRAME_HEADER_LEN: usize = 12;
const FRAME_COUNT_OFFSET: u64 = 24;

/// Stream parameters written into the file header
#[derive(Debug, Clone, Copy)]
pub struct IvfHeader {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub frame_rate: u32,
    pub time_scale: u32,
}

impl Default for IvfHeader {
    fn default() -> Self {
        Self {
            codec: VideoCodec::VP8,
            width: 640,
            height: 480,
            frame_rate: 30,
            time_scale: 1,
        }
    }
}

impl IvfHeader {
    fn to_bytes(self) -> [u8; IVF_HEADER_LEN] {
        let mut header = [0u8; IVF_HEADER_LEN];
        header[0..4].copy_from_slice(IVF_SIGNATURE);
        header[4..6].copy_from_slice(&0u16.to_le_bytes());
        header[6..8].copy_from_slice(&(IVF_HEADER_LEN as u16).to_le_bytes());
        header[8..12].copy_from_slice(&self.codec.fourcc());
        header[12..14].copy_from_slice(&self.width.to_le_bytes());
        header[14..16].copy_from_slice(&self.height.to_le_bytes());
        header[16..20].copy_from_slice(&self.frame_rate.to_le_bytes());
        header[20..24].copy_from_slice(&self.time_scale.to_le_bytes());
        // 24..28 frame count placeholder, 28..32 reserved
        header
    }
}

/// Assembles depacketized RTP payloads into frames and writes them as IVF
pub struct IvfWriter<W: Write + Seek> {
    out: Option<W>,
    depacketizer: FrameDepacketizer,
    current_frame: Vec<u8>,
    frame_count: u64,
    poisoned: bool,
}

impl IvfWriter<BufWriter<File>> {
    /// Create (or truncate) `path` and write the IVF header
    pub fn create(path: impl AsRef<Path>, header: IvfHeader) -> Result<Self, RecordingError> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write + Seek> IvfWriter<W> {
    pub fn new(mut out: W, header: IvfHeader) -> Result<Self, RecordingError> {
        out.write_all(&header.to_bytes())?;

        Ok(Self {
            out: Some(out),
            depacketizer: header.codec.depacketizer(),
            current_frame: Vec::new(),
            frame_count: 0,
            poisoned: false,
        })
    }

    /// Frames written so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    fn write_frame(&mut self) -> Result<(), RecordingError> {
        let out = self.out.as_mut().ok_or(RecordingError::Closed)?;

        let mut frame_header = [0u8; IVF_FRAME_HEADER_LEN];
        frame_header[0..4].copy_from_slice(&(self.current_frame.len() as u32).to_le_bytes());
        frame_header[4..12].copy_from_slice(&self.frame_count.to_le_bytes());

        out.write_all(&frame_header)?;
        out.write_all(&self.current_frame)?;

        self.frame_count += 1;
        self.current_frame.clear();
        Ok(())
    }
}

impl<W: Write + Seek + Send> MediaWriter for IvfWriter<W> {
    fn write_rtp(&mut self, packet: &Packet) -> Result<(), RecordingError> {
        if self.out.is_none() {
            return Err(RecordingError::Closed);
        }
        if self.poisoned {
            return Err(RecordingError::Poisoned);
        }

        let payload = match self.depacketizer.depacketize(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // A lost fragment leaves the frame buffer in an unknown state
                self.poisoned = true;
                self.current_frame.clear();
                return Err(e.into());
            }
        };
        self.current_frame.extend_from_slice(&payload);

        if !packet.header.marker || self.current_frame.is_empty() {
            return Ok(());
        }

        self.write_frame()
    }

    fn close(&mut self) -> Result<(), RecordingError> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };

        out.seek(SeekFrom::Start(FRAME_COUNT_OFFSET))?;
        out.write_all(&(self.frame_count as u32).to_le_bytes())?;
        out.seek(SeekFrom::End(0))?;
        out.flush()?;

        tracing::debug!("Closed IVF writer after {} frames", self.frame_count);
        Ok(())
    }
}

impl<W: Write + Seek> Drop for IvfWriter<W> {
    fn drop(&mut self) {
        if self.out.is_some() {
            tracing::warn!(
                "IVF writer dropped without close, frame count left unpatched ({} frames)",
                self.frame_count
            );
        }
    }
}
