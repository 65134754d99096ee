//! Ogg/Opus audio container writer
//!
//! Produces an identification page (`OpusHead`, beginning-of-stream), a
//! comment page (`OpusTags`) and then one page per Opus packet. Like the IVF
//! writer, the file is finalized on close: the last page is rewritten with the
//! end-of-stream flag set.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use webrtc::rtp::packet::Packet;

use crate::codec::FrameDepacketizer;
use crate::writer::{MediaWriter, RecordingError};

const PAGE_HEADER_LEN: usize = 27;
const PAGE_HEADER_TYPE_OFFSET: usize = 5;
const PAGE_CHECKSUM_OFFSET: usize = 22;
const MAX_PAGE_PAYLOAD: usize = 255 * 255 - 1;

const HEADER_TYPE_CONTINUATION: u8 = 0x00;
const HEADER_TYPE_BEGIN_OF_STREAM: u8 = 0x02;
const HEADER_TYPE_END_OF_STREAM: u8 = 0x04;

/// Samples the decoder discards at startup (80ms at 48kHz)
const OPUS_PRE_SKIP: u16 = 3840;
const VENDOR: &str = "fanout";

#[derive(Debug, Clone, Copy)]
pub struct OggHeader {
    pub sample_rate: u32,
    pub channels: u8,
    pub serial: u32,
}

impl Default for OggHeader {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            serial: 0x6661_6e6f,
        }
    }
}

/// Writes Opus RTP payloads as Ogg pages
pub struct OggWriter<W: Write + Seek> {
    out: Option<W>,
    depacketizer: FrameDepacketizer,
    serial: u32,
    page_index: u32,
    granule_position: u64,
    last_timestamp: Option<u32>,
    /// Byte offset and contents of the most recent page, kept for the
    /// end-of-stream rewrite
    last_page: Option<(u64, Vec<u8>)>,
    position: u64,
    packet_count: u64,
    poisoned: bool,
}

impl OggWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, header: OggHeader) -> Result<Self, RecordingError> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write + Seek> OggWriter<W> {
    pub fn new(out: W, header: OggHeader) -> Result<Self, RecordingError> {
        let mut writer = Self {
            out: Some(out),
            depacketizer: FrameDepacketizer::opus(),
            serial: header.serial,
            page_index: 0,
            granule_position: 0,
            last_timestamp: None,
            last_page: None,
            position: 0,
            packet_count: 0,
            poisoned: false,
        };

        let mut id_header = Vec::with_capacity(19);
        id_header.extend_from_slice(b"OpusHead");
        id_header.push(1); // version
        id_header.push(header.channels);
        id_header.extend_from_slice(&OPUS_PRE_SKIP.to_le_bytes());
        id_header.extend_from_slice(&header.sample_rate.to_le_bytes());
        id_header.extend_from_slice(&0u16.to_le_bytes()); // output gain
        id_header.push(0); // channel mapping family
        writer.write_page(&id_header, HEADER_TYPE_BEGIN_OF_STREAM)?;

        let mut comment_header = Vec::with_capacity(16 + VENDOR.len());
        comment_header.extend_from_slice(b"OpusTags");
        comment_header.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
        comment_header.extend_from_slice(VENDOR.as_bytes());
        comment_header.extend_from_slice(&0u32.to_le_bytes()); // user comment count
        writer.write_page(&comment_header, HEADER_TYPE_CONTINUATION)?;

        Ok(writer)
    }

    /// Opus packets written so far
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    fn write_page(&mut self, payload: &[u8], header_type: u8) -> Result<(), RecordingError> {
        let out = self.out.as_mut().ok_or(RecordingError::Closed)?;
        let page = build_page(
            payload,
            header_type,
            self.granule_position,
            self.serial,
            self.page_index,
        )?;

        out.write_all(&page)?;

        let offset = self.position;
        self.position += page.len() as u64;
        self.page_index = self.page_index.wrapping_add(1);
        self.last_page = Some((offset, page));
        Ok(())
    }
}

impl<W: Write + Seek + Send> MediaWriter for OggWriter<W> {
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
                self.poisoned = true;
                return Err(e.into());
            }
        };

        let timestamp = packet.header.timestamp;
        if let Some(previous) = self.last_timestamp {
            self.granule_position += u64::from(timestamp.wrapping_sub(previous));
        }
        self.last_timestamp = Some(timestamp);

        self.write_page(&payload, HEADER_TYPE_CONTINUATION)?;
        self.packet_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RecordingError> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };

        if let Some((offset, mut page)) = self.last_page.take() {
            page[PAGE_HEADER_TYPE_OFFSET] |= HEADER_TYPE_END_OF_STREAM;
            page[PAGE_CHECKSUM_OFFSET..PAGE_CHECKSUM_OFFSET + 4].fill(0);
            let checksum = ogg_crc(&page);
            page[PAGE_CHECKSUM_OFFSET..PAGE_CHECKSUM_OFFSET + 4]
                .copy_from_slice(&checksum.to_le_bytes());

            out.seek(SeekFrom::Start(offset))?;
            out.write_all(&page)?;
            out.seek(SeekFrom::End(0))?;
        }
        out.flush()?;

        tracing::debug!("Closed Ogg writer after {} packets", self.packet_count);
        Ok(())
    }
}

fn build_page(
    payload: &[u8],
    header_type: u8,
    granule_position: u64,
    serial: u32,
    page_index: u32,
) -> Result<Vec<u8>, RecordingError> {
    if payload.len() > MAX_PAGE_PAYLOAD {
        return Err(RecordingError::PacketTooLarge(payload.len()));
    }

    // Lacing values: one 255 per full segment, then the remainder (possibly 0)
    let full_segments = payload.len() / 255;
    let segment_count = full_segments + 1;

    let mut page = Vec::with_capacity(PAGE_HEADER_LEN + segment_count + payload.len());
    page.extend_from_slice(b"OggS");
    page.push(0); // stream structure version
    page.push(header_type);
    page.extend_from_slice(&granule_position.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&page_index.to_le_bytes());
    page.extend_from_slice(&[0; 4]); // checksum, filled below
    page.push(segment_count as u8);
    page.extend(std::iter::repeat_n(255u8, full_segments));
    page.push((payload.len() % 255) as u8);
    page.extend_from_slice(payload);

    let checksum = ogg_crc(&page);
    page[PAGE_CHECKSUM_OFFSET..PAGE_CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    Ok(page)
}

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// Ogg page checksum: CRC-32, polynomial 0x04c11db7, no reflection, zero init
fn ogg_crc(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ byte) as usize]
    })
}
