//! Track relay loop
//!
//! Reads RTP from one inbound track and writes it, unmodified and in receipt
//! order, to the room's relay track for that kind. Forwarding whole RTP
//! packets keeps codec packetization (VP8 partitions, H.264 FU-A) intact.

use super::room::Room;
use super::SfuSettings;
use crate::transport::{
    InboundTrack, MediaKind, MediaTransport, OutboundTrack, PublisherLink, TransportError,
};
use fanout_media::Recorder;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Aborts the wrapped task when dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(super) async fn run_relay<T: MediaTransport>(
    transport: Arc<T>,
    settings: Arc<SfuSettings>,
    room: Arc<Room<T>>,
    inbound: T::Inbound,
) {
    let info = inbound.info();

    let outbound = match transport.create_outbound_track(&info, &settings.stream_label) {
        Ok(track) => track,
        Err(e) => {
            tracing::warn!(
                "Room {}: failed to create relay track for {}: {}",
                room.id(),
                info.kind,
                e
            );
            return;
        }
    };

    if !room.slot(info.kind).install(outbound.clone()) {
        tracing::warn!(
            "Room {} already relays a {} track, ignoring ssrc {}",
            room.id(),
            info.kind,
            info.ssrc
        );
        return;
    }

    tracing::info!(
        "Room {}: relaying {} track (ssrc: {}, codec: {}, pt: {})",
        room.id(),
        info.kind,
        info.ssrc,
        info.codec.mime_type,
        info.payload_type
    );

    let _ticker = (info.kind == MediaKind::Video && !settings.keyframe_interval.is_zero())
        .then(|| spawn_keyframe_ticker(room.clone(), info.ssrc, settings.keyframe_interval));

    let recorder = settings.recording.as_ref().and_then(|options| {
        let stem = format!("room-{}-{}", room.id(), info.kind);
        Recorder::open(options, &stem, &info.codec.mime_type, info.ssrc)
    });

    let mut packet_count = 0u64;
    let mut write_failures = 0u64;

    loop {
        let packet = tokio::select! {
            biased;
            _ = room.publisher().closed() => {
                tracing::debug!("Room {}: publisher closed, stopping {} relay", room.id(), info.kind);
                break;
            }
            result = inbound.read_packet() => match result {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::info!("Room {}: {} source track ended: {}", room.id(), info.kind, e);
                    break;
                }
            },
        };

        packet_count += 1;

        if let Some(recorder) = &recorder {
            recorder.submit(packet.clone());
        }

        // Per-subscriber failures leave the relay running; the packet still
        // reached the other subscribers.
        match outbound.write_packet(&packet).await {
            Ok(()) | Err(TransportError::NoSubscribers) => {}
            Err(TransportError::SubscriberWrite(e)) => {
                write_failures += 1;
                if write_failures % 100 == 1 {
                    tracing::warn!(
                        "Room {}: {} packet {} missed a subscriber ({} so far): {}",
                        room.id(),
                        info.kind,
                        packet_count,
                        write_failures,
                        e
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Room {}: failed to forward {} packet {}: {}",
                    room.id(),
                    info.kind,
                    packet_count,
                    e
                );
                break;
            }
        }

        if packet_count % 1000 == 1 {
            tracing::debug!(
                "Room {}: forwarded {} packet {} (seq: {}, ts: {})",
                room.id(),
                info.kind,
                packet_count,
                packet.header.sequence_number,
                packet.header.timestamp
            );
        }
    }

    if let Some(recorder) = recorder {
        recorder.finish().await;
    }

    tracing::info!(
        "Room {}: {} relay stopped after {} packets ({} write failures)",
        room.id(),
        info.kind,
        packet_count,
        write_failures
    );
}

/// Periodically ask the publisher for a keyframe so late joiners can start
/// decoding. The first request goes out one period after the relay starts.
fn spawn_keyframe_ticker<T: MediaTransport>(
    room: Arc<Room<T>>,
    media_ssrc: u32,
    period: Duration,
) -> TaskGuard {
    TaskGuard(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(e) = room.publisher().request_keyframe(media_ssrc).await {
                tracing::warn!("Room {}: keyframe request failed: {}", room.id(), e);
            }
        }
    }))
}
