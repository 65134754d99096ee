//! SFU hub: registry of active rooms
//!
//! Rooms are created and removed only by the hub task, which consumes
//! commands one at a time. Lookups read the shared map directly.

use super::relay::run_relay;
use super::room::{Room, RoomId};
use super::{SfuError, SfuSettings};
use crate::transport::{MediaTransport, PublisherLink};
use fanout_protocol::SessionDescription;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

const COMMAND_QUEUE: usize = 64;

type RoomMap<T> = Arc<RwLock<HashMap<RoomId, Arc<Room<T>>>>>;

enum HubCommand<T: MediaTransport> {
    Create {
        publisher: T::Publisher,
        reply: oneshot::Sender<Arc<Room<T>>>,
    },
    Remove {
        id: RoomId,
        reply: oneshot::Sender<bool>,
    },
}

pub struct SfuHub<T: MediaTransport> {
    transport: Arc<T>,
    settings: Arc<SfuSettings>,
    rooms: RoomMap<T>,
    commands: mpsc::Sender<HubCommand<T>>,
}

impl<T: MediaTransport> Clone for SfuHub<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            rooms: self.rooms.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<T: MediaTransport> SfuHub<T> {
    /// Start the hub task. It runs until every handle is dropped.
    pub fn spawn(transport: Arc<T>, settings: SfuSettings) -> Self {
        let rooms: RoomMap<T> = Arc::new(RwLock::new(HashMap::new()));
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);

        tokio::spawn(run_hub(receiver, rooms.clone()));

        Self {
            transport,
            settings: Arc::new(settings),
            rooms,
            commands,
        }
    }

    pub fn settings(&self) -> &SfuSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Register a new room owning `publisher`
    pub async fn create_room(&self, publisher: T::Publisher) -> Result<Arc<Room<T>>, SfuError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Create { publisher, reply })
            .await
            .map_err(|_| SfuError::HubClosed)?;
        response.await.map_err(|_| SfuError::HubClosed)
    }

    /// Remove a room and close its publisher. Returns false if no such room.
    pub async fn remove_room(&self, id: RoomId) -> Result<bool, SfuError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Remove { id, reply })
            .await
            .map_err(|_| SfuError::HubClosed)?;
        response.await.map_err(|_| SfuError::HubClosed)
    }

    pub async fn get_room(&self, id: RoomId) -> Option<Arc<Room<T>>> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Accept a publisher's offer, open a room for it and start relaying its
    /// tracks as they arrive
    pub async fn publish(
        &self,
        offer: SessionDescription,
    ) -> Result<(RoomId, SessionDescription), SfuError> {
        let session = self.transport.accept_publisher(offer).await?;
        let room = self.create_room(session.publisher).await?;
        let id = room.id();

        tokio::spawn(self.clone().supervise(room, session.tracks));

        Ok((id, session.answer))
    }

    /// Subscribe to a room: wait for its video track, then negotiate a
    /// session carrying the room's relay tracks
    pub async fn join(
        &self,
        room_id: RoomId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SfuError> {
        let room = self
            .get_room(room_id)
            .await
            .ok_or(SfuError::RoomNotFound(room_id))?;

        let video = tokio::select! {
            track = room.video().wait(self.settings.track_wait_timeout) => {
                track.ok_or(SfuError::TrackTimeout(room_id))?
            }
            _ = room.publisher().closed() => return Err(SfuError::RoomNotFound(room_id)),
        };

        let mut tracks = vec![video];
        if let Some(audio) = room.audio().wait(Some(self.settings.audio_wait)).await {
            tracks.push(audio);
        }

        let track_count = tracks.len();
        let answer = self.transport.accept_subscriber(offer, tracks).await?;

        tracing::info!(
            "Subscriber joined room {} ({} tracks)",
            room_id,
            track_count
        );

        Ok(answer)
    }

    /// Spawn a relay loop for every inbound track until the publisher goes
    /// away, then remove the room
    async fn supervise(
        self,
        room: Arc<Room<T>>,
        mut tracks: mpsc::Receiver<T::Inbound>,
    ) {
        let closed = room.publisher().closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => break,
                track = tracks.recv() => match track {
                    Some(inbound) => {
                        tokio::spawn(run_relay(
                            self.transport.clone(),
                            self.settings.clone(),
                            room.clone(),
                            inbound,
                        ));
                    }
                    None => {
                        (&mut closed).await;
                        break;
                    }
                },
            }
        }

        tracing::info!("Publisher of room {} disconnected", room.id());

        if let Err(e) = self.remove_room(room.id()).await {
            tracing::debug!("Could not remove room {}: {}", room.id(), e);
        }
    }
}

async fn run_hub<T: MediaTransport>(
    mut commands: mpsc::Receiver<HubCommand<T>>,
    rooms: RoomMap<T>,
) {
    let mut next_id: RoomId = 1;

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Create { publisher, reply } => {
                let id = next_id;
                next_id += 1;

                let room = Arc::new(Room::new(id, publisher));
                rooms.write().await.insert(id, room.clone());
                tracing::info!("Created room {}", id);

                if reply.send(room).is_err() {
                    // Requester went away before learning the id
                    if let Some(room) = rooms.write().await.remove(&id) {
                        close_publisher(room);
                    }
                }
            }
            HubCommand::Remove { id, reply } => {
                let removed = rooms.write().await.remove(&id);
                let found = removed.is_some();
                if let Some(room) = removed {
                    tracing::info!("Removed room {}", id);
                    close_publisher(room);
                }
                let _ = reply.send(found);
            }
        }
    }

    tracing::debug!("SFU hub stopped");
}

fn close_publisher<T: MediaTransport>(room: Arc<Room<T>>) {
    tokio::spawn(async move {
        if let Err(e) = room.publisher().close().await {
            tracing::debug!("Error closing publisher of room {}: {}", room.id(), e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        MediaKind, MemoryTransport, OutboundTrack, PublisherControl, TransportError,
    };
    use bytes::Bytes;
    use std::time::Duration;
    use webrtc::rtp::header::Header;
    use webrtc::rtp::packet::Packet;

    const WAIT: Duration = Duration::from_secs(2);

    fn offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\n")
    }

    fn packet(seq: u16, marker: bool, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                sequence_number: seq,
                timestamp: u32::from(seq) * 3000,
                marker,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn hub_with(settings: SfuSettings) -> (Arc<MemoryTransport>, SfuHub<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let hub = SfuHub::spawn(transport.clone(), settings);
        (transport, hub)
    }

    fn hub() -> (Arc<MemoryTransport>, SfuHub<MemoryTransport>) {
        hub_with(SfuSettings::default())
    }

    async fn publish(
        transport: &MemoryTransport,
        hub: &SfuHub<MemoryTransport>,
    ) -> (RoomId, PublisherControl) {
        let (id, _answer) = hub.publish(offer()).await.unwrap();
        (id, transport.take_publisher().unwrap())
    }

    async fn wait_until_removed(hub: &SfuHub<MemoryTransport>, id: RoomId) {
        tokio::time::timeout(WAIT, async {
            while hub.get_room(id).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room should be removed");
    }

    #[tokio::test]
    async fn test_room_ids_are_monotonic() {
        let (transport, hub) = hub();
        let (first, _a) = publish(&transport, &hub).await;
        let (second, _b) = publish(&transport, &hub).await;

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(hub.room_ids().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_get_distinct_rooms() {
        let (_transport, hub) = hub();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move { hub.publish(offer()).await }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().0);
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=16).collect::<Vec<_>>());
        assert_eq!(hub.room_count().await, 16);
    }

    #[tokio::test]
    async fn test_join_unknown_room_fails_immediately() {
        let (_transport, hub) = hub();

        let result = tokio::time::timeout(WAIT, hub.join(42, offer()))
            .await
            .expect("join must not block");
        assert!(matches!(result, Err(SfuError::RoomNotFound(42))));
    }

    #[tokio::test]
    async fn test_bad_offer_is_negotiation_error() {
        let (_transport, hub) = hub();
        let result = hub.publish(SessionDescription::offer("")).await;
        assert!(matches!(
            result,
            Err(SfuError::Transport(TransportError::Negotiation(_)))
        ));
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_waits_for_video_track() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;

        let join = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.join(id, offer()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!join.is_finished());

        let _feed = control
            .add_track(MediaKind::Video, 1111, "video/VP8")
            .await
            .unwrap();

        tokio::time::timeout(WAIT, join)
            .await
            .expect("join should complete once video is installed")
            .unwrap()
            .unwrap();

        let room = hub.get_room(id).await.unwrap();
        let installed = room.video().get().unwrap();
        let subscriber = transport.take_subscriber().unwrap();
        assert_eq!(subscriber.tracks.len(), 1);
        assert!(Arc::ptr_eq(&subscriber.tracks[0], &installed));
    }

    #[tokio::test]
    async fn test_subscribers_share_relay_tracks() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;

        let _video = control
            .add_track(MediaKind::Video, 1, "video/VP8")
            .await
            .unwrap();
        let _audio = control
            .add_track(MediaKind::Audio, 2, "audio/opus")
            .await
            .unwrap();

        let room = hub.get_room(id).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while !room.audio().is_ready() || !room.video().is_ready() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        hub.join(id, offer()).await.unwrap();
        hub.join(id, offer()).await.unwrap();

        let first = transport.take_subscriber().unwrap();
        let second = transport.take_subscriber().unwrap();
        assert_eq!(first.tracks.len(), 2);
        assert!(Arc::ptr_eq(&first.tracks[0], &second.tracks[0]));
        assert!(Arc::ptr_eq(&first.tracks[1], &second.tracks[1]));
        assert_eq!(first.tracks[0].kind(), MediaKind::Video);
        assert_eq!(first.tracks[1].kind(), MediaKind::Audio);
        assert_eq!(first.tracks[0].stream_label(), "fanout");
    }

    #[tokio::test]
    async fn test_join_times_out_without_video() {
        let (transport, hub) = hub_with(SfuSettings {
            track_wait_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let (id, control) = publish(&transport, &hub).await;
        let _audio = control
            .add_track(MediaKind::Audio, 2, "audio/opus")
            .await
            .unwrap();

        let result = hub.join(id, offer()).await;
        assert!(matches!(result, Err(SfuError::TrackTimeout(_))));
        assert!(transport.take_subscriber().is_none());
    }

    #[tokio::test]
    async fn test_packets_relayed_in_order() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;
        let feed = control
            .add_track(MediaKind::Video, 7, "video/VP8")
            .await
            .unwrap();

        hub.join(id, offer()).await.unwrap();
        let mut subscriber = transport.take_subscriber().unwrap();

        for seq in 0..20u16 {
            feed.send(packet(seq, seq % 5 == 4, &[0x10, seq as u8]))
                .await
                .unwrap();
        }

        for seq in 0..20u16 {
            let received = tokio::time::timeout(WAIT, subscriber.receivers[0].recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.header.sequence_number, seq);
            assert_eq!(received.payload.as_ref(), &[0x10, seq as u8]);
        }
    }

    #[tokio::test]
    async fn test_second_track_of_same_kind_is_ignored() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;

        let _first = control
            .add_track(MediaKind::Video, 1, "video/VP8")
            .await
            .unwrap();
        let room = hub.get_room(id).await.unwrap();
        let installed = room.video().wait(Some(WAIT)).await.unwrap();

        let _second = control
            .add_track(MediaKind::Video, 2, "video/VP8")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(Arc::ptr_eq(&room.video().get().unwrap(), &installed));
    }

    #[tokio::test]
    async fn test_video_relay_requests_keyframes() {
        let (transport, hub) = hub_with(SfuSettings {
            keyframe_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let (_id, mut control) = publish(&transport, &hub).await;
        let _feed = control
            .add_track(MediaKind::Video, 0xabcd, "video/VP8")
            .await
            .unwrap();

        for _ in 0..2 {
            let ssrc = tokio::time::timeout(WAIT, control.next_keyframe_request())
                .await
                .expect("keyframe request expected")
                .unwrap();
            assert_eq!(ssrc, 0xabcd);
        }
    }

    #[tokio::test]
    async fn test_audio_relay_does_not_request_keyframes() {
        let (transport, hub) = hub_with(SfuSettings {
            keyframe_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let (_id, mut control) = publish(&transport, &hub).await;
        let _feed = control
            .add_track(MediaKind::Audio, 3, "audio/opus")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(control.try_keyframe_request().is_none());
    }

    #[tokio::test]
    async fn test_publisher_close_removes_room() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;
        let _feed = control
            .add_track(MediaKind::Video, 1, "video/VP8")
            .await
            .unwrap();

        control.close();
        wait_until_removed(&hub, id).await;

        let result = hub.join(id, offer()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_room_closes_publisher() {
        let (transport, hub) = hub();
        let (id, control) = publish(&transport, &hub).await;

        assert!(hub.remove_room(id).await.unwrap());
        assert!(!hub.remove_room(id).await.unwrap());

        tokio::time::timeout(WAIT, async {
            while !control.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("publisher should be closed");
    }

    #[tokio::test]
    async fn test_relay_records_video() {
        let dir = tempfile::tempdir().unwrap();
        let recording = fanout_media::RecordingOptions {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (transport, hub) = hub_with(SfuSettings {
            recording: Some(recording),
            ..Default::default()
        });
        let (id, control) = publish(&transport, &hub).await;
        let feed = control
            .add_track(MediaKind::Video, 9, "video/VP8")
            .await
            .unwrap();

        feed.send(packet(1, false, &[0x10, 1, 2])).await.unwrap();
        feed.send(packet(2, true, &[0x00, 3, 4])).await.unwrap();
        drop(feed);

        let path = dir.path().join(format!("room-{}-video.ivf", id));
        tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(bytes) = std::fs::read(&path) {
                    if bytes.len() >= 32 && bytes[24..28] == 1u32.to_le_bytes() {
                        return bytes;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map(|bytes| assert_eq!(bytes.len(), 32 + 12 + 4))
        .expect("recording should be closed with one frame");
    }

    async fn recv(receiver: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
        tokio::time::timeout(WAIT, receiver.recv())
            .await
            .expect("packet expected")
            .expect("track still bound")
    }

    fn video_only() -> SfuSettings {
        SfuSettings {
            audio_wait: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_join_gives_late_audio_a_grace_period() {
        let (transport, hub) = hub_with(SfuSettings {
            audio_wait: Duration::from_secs(1),
            ..Default::default()
        });
        let (id, control) = publish(&transport, &hub).await;
        let _video = control
            .add_track(MediaKind::Video, 1, "video/VP8")
            .await
            .unwrap();

        let join = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.join(id, offer()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _audio = control
            .add_track(MediaKind::Audio, 2, "audio/opus")
            .await
            .unwrap();

        tokio::time::timeout(WAIT, join)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let subscriber = transport.take_subscriber().unwrap();
        assert_eq!(subscriber.tracks.len(), 2);
        assert_eq!(subscriber.tracks[1].kind(), MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_stop_relay() {
        let (transport, hub) = hub_with(video_only());
        let (id, control) = publish(&transport, &hub).await;
        let feed = control
            .add_track(MediaKind::Video, 7, "video/VP8")
            .await
            .unwrap();

        hub.join(id, offer()).await.unwrap();
        hub.join(id, offer()).await.unwrap();
        let broken = transport.take_subscriber().unwrap();
        let mut healthy = transport.take_subscriber().unwrap();
        broken.fail_writes();

        for seq in 0..10u16 {
            feed.send(packet(seq, true, &[0x10, seq as u8])).await.unwrap();
        }
        for seq in 0..10u16 {
            assert_eq!(recv(&mut healthy.receivers[0]).await.header.sequence_number, seq);
        }

        assert!(hub.get_room(id).await.is_some());
    }

    #[tokio::test]
    async fn test_packets_before_first_subscriber_are_dropped() {
        let (transport, hub) = hub_with(video_only());
        let (id, control) = publish(&transport, &hub).await;
        let feed = control
            .add_track(MediaKind::Video, 7, "video/VP8")
            .await
            .unwrap();
        let room = hub.get_room(id).await.unwrap();
        room.video().wait(Some(WAIT)).await.unwrap();

        for seq in 0..5u16 {
            feed.send(packet(seq, true, &[0x10])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.join(id, offer()).await.unwrap();
        let mut subscriber = transport.take_subscriber().unwrap();

        for seq in 5..10u16 {
            feed.send(packet(seq, true, &[0x10])).await.unwrap();
        }
        for seq in 5..10u16 {
            assert_eq!(recv(&mut subscriber.receivers[0]).await.header.sequence_number, seq);
        }
    }

    #[tokio::test]
    async fn test_failed_join_leaves_room_usable() {
        let (transport, hub) = hub_with(video_only());
        let (id, control) = publish(&transport, &hub).await;
        let _feed = control
            .add_track(MediaKind::Video, 1, "video/VP8")
            .await
            .unwrap();

        let result = hub.join(id, SessionDescription::offer("")).await;
        assert!(matches!(
            result,
            Err(SfuError::Transport(TransportError::Negotiation(_)))
        ));
        assert!(transport.take_subscriber().is_none());

        hub.join(id, offer()).await.unwrap();
        let subscriber = transport.take_subscriber().unwrap();
        let room = hub.get_room(id).await.unwrap();
        assert!(Arc::ptr_eq(&subscriber.tracks[0], &room.video().get().unwrap()));
    }

    #[tokio::test]
    async fn test_failed_keyframe_request_keeps_relaying() {
        let (transport, hub) = hub_with(SfuSettings {
            keyframe_interval: Duration::from_millis(10),
            audio_wait: Duration::ZERO,
            ..Default::default()
        });
        let (id, mut control) = publish(&transport, &hub).await;
        control.reject_keyframe_requests(true);

        let feed = control
            .add_track(MediaKind::Video, 0x77, "video/VP8")
            .await
            .unwrap();
        hub.join(id, offer()).await.unwrap();
        let mut subscriber = transport.take_subscriber().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control.try_keyframe_request().is_none());

        feed.send(packet(1, true, &[0x10])).await.unwrap();
        assert_eq!(recv(&mut subscriber.receivers[0]).await.header.sequence_number, 1);

        control.reject_keyframe_requests(false);
        let ssrc = tokio::time::timeout(WAIT, control.next_keyframe_request())
            .await
            .expect("ticker should still be running")
            .unwrap();
        assert_eq!(ssrc, 0x77);
    }
}
