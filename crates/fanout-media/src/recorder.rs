//! Background recording of one RTP stream

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use webrtc::rtp::packet::Packet;

use crate::codec::{AudioCodec, VideoCodec};
use crate::ivf::{IvfHeader, IvfWriter};
use crate::ogg::{OggHeader, OggWriter};
use crate::queue::DropOldestQueue;
use crate::writer::{MediaWriter, RecordingError};

/// Where and how relayed streams are recorded
#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub directory: PathBuf,
    pub queue_capacity: usize,
    pub width: u16,
    pub height: u16,
    pub frame_rate: u32,
    pub time_scale: u32,
    pub opus_sample_rate: u32,
    pub opus_channels: u8,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            queue_capacity: 512,
            width: 640,
            height: 480,
            frame_rate: 30,
            time_scale: 1,
            opus_sample_rate: 48000,
            opus_channels: 2,
        }
    }
}

/// Feeds packets to a [`MediaWriter`] on the blocking thread pool.
///
/// `submit` never blocks: packets go through a [`DropOldestQueue`] and are
/// lost, oldest first, if the writer cannot keep up. Opening the file and
/// every write happen off the async workers, so a slow disk only costs
/// packets. The first write error ends the recording; the file is still
/// closed so what was written stays readable.
pub struct Recorder {
    name: String,
    queue: Arc<DropOldestQueue<Packet>>,
    task: Option<JoinHandle<()>>,
}

type OpenWriter = Box<dyn FnOnce() -> Result<Box<dyn MediaWriter>, RecordingError> + Send>;

impl Recorder {
    pub fn spawn(name: impl Into<String>, writer: Box<dyn MediaWriter>, capacity: usize) -> Self {
        Self::start(name.into(), capacity, Box::new(move || Ok(writer)))
    }

    /// Start recording `mime_type` under the recording directory. The
    /// directory and file are created by the writer task.
    ///
    /// Returns `None` for codecs that have no container here.
    pub fn open(
        options: &RecordingOptions,
        stem: &str,
        mime_type: &str,
        serial: u32,
    ) -> Option<Self> {
        let directory = options.directory.clone();

        let open: OpenWriter = if let Some(codec) = VideoCodec::from_mime_type(mime_type) {
            let path = directory.join(format!("{}.ivf", stem));
            let header = IvfHeader {
                codec,
                width: options.width,
                height: options.height,
                frame_rate: options.frame_rate,
                time_scale: options.time_scale,
            };
            Box::new(move || {
                create_writer(&directory, &path, |path| IvfWriter::create(path, header))
            })
        } else if let Some(AudioCodec::Opus) = AudioCodec::from_mime_type(mime_type) {
            let path = directory.join(format!("{}.ogg", stem));
            let header = OggHeader {
                sample_rate: options.opus_sample_rate,
                channels: options.opus_channels,
                serial,
            };
            Box::new(move || {
                create_writer(&directory, &path, |path| OggWriter::create(path, header))
            })
        } else {
            tracing::debug!("No recording container for {}", mime_type);
            return None;
        };

        Some(Self::start(stem.to_string(), options.queue_capacity, open))
    }

    fn start(name: String, capacity: usize, open: OpenWriter) -> Self {
        let queue = Arc::new(DropOldestQueue::new(capacity));
        let runtime = Handle::current();
        let task = tokio::task::spawn_blocking({
            let name = name.clone();
            let queue = queue.clone();
            move || match open() {
                Ok(writer) => run_writer(&runtime, &name, &queue, writer),
                Err(e) => {
                    queue.close();
                    tracing::warn!("Recording {} disabled: {}", name, e);
                }
            }
        });

        Self {
            name,
            queue,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a packet for writing
    pub fn submit(&self, packet: Packet) {
        if self.queue.push(packet) {
            let dropped = self.queue.dropped();
            if dropped % 100 == 1 {
                tracing::warn!(
                    "Recorder {} falling behind, {} packets dropped so far",
                    self.name,
                    dropped
                );
            }
        }
    }

    /// False once the writer has stopped (error or `finish`)
    pub fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Packets discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Write out whatever is queued, then close the file
    pub async fn finish(mut self) {
        self.queue.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Recorder {} task failed: {}", self.name, e);
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        // The writer task drains and closes on its own
        self.queue.close();
    }
}

fn create_writer<W, F>(
    directory: &Path,
    path: &Path,
    create: F,
) -> Result<Box<dyn MediaWriter>, RecordingError>
where
    W: MediaWriter + 'static,
    F: FnOnce(&Path) -> Result<W, RecordingError>,
{
    std::fs::create_dir_all(directory)?;
    let writer = create(path)?;
    tracing::info!("Recording to {}", path.display());
    Ok(Box::new(writer))
}

/// Runs on a blocking thread; only the queue wait goes through the runtime
fn run_writer(
    runtime: &Handle,
    name: &str,
    queue: &DropOldestQueue<Packet>,
    mut writer: Box<dyn MediaWriter>,
) {
    let mut written = 0u64;

    while let Some(packet) = runtime.block_on(queue.pop()) {
        if let Err(e) = writer.write_rtp(&packet) {
            tracing::warn!("Recorder {} stopped after {} packets: {}", name, written, e);
            break;
        }
        written += 1;
    }

    queue.close();
    if let Err(e) = writer.close() {
        tracing::warn!("Failed to close recording {}: {}", name, e);
    }

    tracing::info!("Recorder {} finished ({} packets)", name, written);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use webrtc::rtp::header::Header;

    /// Takes `delay` of wall time per packet, like a disk that cannot keep up
    struct SlowWriter {
        delay: Duration,
        written: Arc<AtomicUsize>,
    }

    impl MediaWriter for SlowWriter {
        fn write_rtp(&mut self, _packet: &Packet) -> Result<(), RecordingError> {
            std::thread::sleep(self.delay);
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<(), RecordingError> {
            Ok(())
        }
    }

    fn vp8_packet(payload: &[u8], marker: bool) -> Packet {
        Packet {
            header: Header {
                marker,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn frame_count(path: &std::path::Path) -> u32 {
        let bytes = std::fs::read(path).unwrap();
        u32::from_le_bytes(bytes[24..28].try_into().unwrap())
    }

    fn options(dir: &tempfile::TempDir) -> RecordingOptions {
        RecordingOptions {
            directory: dir.path().join("rec"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_picks_container_by_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);

        let video = Recorder::open(&options, "room-1-video", "video/VP8", 1);
        let audio = Recorder::open(&options, "room-1-audio", "audio/opus", 1);
        let other = Recorder::open(&options, "room-1-other", "video/AV1", 1);

        assert!(video.is_some());
        assert!(audio.is_some());
        assert!(other.is_none());

        video.unwrap().finish().await;
        audio.unwrap().finish().await;

        assert!(options.directory.join("room-1-video.ivf").exists());
        assert!(options.directory.join("room-1-audio.ogg").exists());
        assert!(!options.directory.join("room-1-other.ivf").exists());
    }

    #[tokio::test]
    async fn test_finish_drains_queue_and_patches_count() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);

        let recorder = Recorder::open(&options, "drain", "video/VP8", 0).unwrap();
        recorder.submit(vp8_packet(&[0x10, 1, 2, 3], false));
        recorder.submit(vp8_packet(&[0x00, 4, 5, 6], true));
        recorder.submit(vp8_packet(&[0x10, 7, 8, 9], true));
        recorder.finish().await;

        let path = options.directory.join("drain.ivf");
        assert_eq!(frame_count(&path), 2);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, 32 + (12 + 6) + (12 + 3));
    }

    #[tokio::test]
    async fn test_bad_payload_stops_recording_but_closes_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(&dir);

        let recorder = Recorder::open(&options, "broken", "video/VP8", 0).unwrap();
        recorder.submit(vp8_packet(&[0x10, 1, 2, 3], true));
        recorder.submit(vp8_packet(&[0x10], true));
        recorder.submit(vp8_packet(&[0x10, 4, 5, 6], true));
        recorder.finish().await;

        assert_eq!(frame_count(&options.directory.join("broken.ivf")), 1);
    }

    #[tokio::test]
    async fn test_slow_writer_does_not_block_runtime() {
        let written = Arc::new(AtomicUsize::new(0));
        let writer = SlowWriter {
            delay: Duration::from_millis(200),
            written: written.clone(),
        };
        let recorder = Recorder::spawn("slow", Box::new(writer), 8);
        for _ in 0..3 {
            recorder.submit(vp8_packet(&[0x10, 1], true));
        }

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(started.elapsed() < Duration::from_millis(150));

        recorder.finish().await;
        assert_eq!(written.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unwritable_directory_disables_recording() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let options = RecordingOptions {
            directory: blocker.join("rec"),
            ..Default::default()
        };

        let recorder = Recorder::open(&options, "video", "video/VP8", 0).unwrap();
        recorder.submit(vp8_packet(&[0x10, 1], true));

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("recorder should stop");
        recorder.finish().await;
    }
}
