use fanout_protocol::{ClientEvent, ServerEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound queue of one connected client. Every message for the client goes
/// through it so the session's writer task is the only socket writer.
pub type ClientSender = mpsc::Sender<String>;

struct Client {
    sender: ClientSender,
    /// Name of the room the client is in, if any
    room: Option<String>,
}

struct SignalRoom {
    /// Members in join order
    members: Vec<String>,
    /// Id of the first client that joined
    stream_id: String,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, Client>,
    rooms: HashMap<String, SignalRoom>,
}

/// Registry of connected signaling clients and the rooms they are in.
///
/// The hub routes addressed messages between peers. It never inspects the
/// session descriptions or candidates it relays.
pub struct SignalingHub {
    state: RwLock<HubState>,
    /// How long a delivery may wait on a full client queue before the
    /// client is treated as unreachable
    write_wait: Duration,
}

impl SignalingHub {
    pub fn new(write_wait: Duration) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            write_wait,
        }
    }

    /// Add a client and return its generated id
    pub async fn register(&self, sender: ClientSender) -> String {
        let id = Uuid::new_v4().to_string();
        self.state
            .write()
            .await
            .clients
            .insert(id.clone(), Client { sender, room: None });

        tracing::debug!("Signaling client {} registered", id);
        id
    }

    /// Remove a client, telling its room-mates it left
    pub async fn unregister(&self, id: &str) {
        self.leave_room(id).await;

        if self.state.write().await.clients.remove(id).is_some() {
            tracing::debug!("Signaling client {} unregistered", id);
        }
    }

    /// Put a client in `room_name`, creating the room if needed.
    ///
    /// Existing members are told about the newcomer; the newcomer gets the
    /// members that could be reached plus the room's stream id.
    pub async fn join_room(&self, id: &str, room_name: &str) {
        // A client is in at most one room
        self.leave_room(id).await;

        let (own_sender, peers, stream_id) = {
            let mut state = self.state.write().await;
            let HubState { clients, rooms } = &mut *state;

            let Some(client) = clients.get_mut(id) else {
                return;
            };
            client.room = Some(room_name.to_string());
            let own_sender = client.sender.clone();

            let room = rooms
                .entry(room_name.to_string())
                .or_insert_with(|| SignalRoom {
                    members: Vec::new(),
                    stream_id: id.to_string(),
                });

            let peers: Vec<(String, ClientSender)> = room
                .members
                .iter()
                .filter_map(|member| {
                    clients
                        .get(member)
                        .map(|peer| (member.clone(), peer.sender.clone()))
                })
                .collect();

            room.members.push(id.to_string());
            (own_sender, peers, room.stream_id.clone())
        };

        tracing::info!(
            "Client {} joined room {} ({} peers)",
            id,
            room_name,
            peers.len()
        );

        let notice = ServerEvent::NewPeerConnected {
            socket_id: id.to_string(),
        };
        let mut connections = Vec::with_capacity(peers.len());
        for (peer_id, sender) in peers {
            if self.deliver(&sender, &notice).await {
                connections.push(peer_id);
            } else {
                tracing::debug!("Peer {} unreachable, leaving it out of get_peers", peer_id);
            }
        }

        let reply = ServerEvent::GetPeers {
            connections,
            you: id.to_string(),
            stream_id,
        };
        self.deliver(&own_sender, &reply).await;
    }

    /// Take a client out of its room and notify the remaining members.
    /// The room itself stays.
    pub async fn leave_room(&self, id: &str) {
        let (room_name, peers) = {
            let mut state = self.state.write().await;
            let HubState { clients, rooms } = &mut *state;

            let Some(room_name) = clients.get_mut(id).and_then(|client| client.room.take()) else {
                return;
            };
            let Some(room) = rooms.get_mut(&room_name) else {
                return;
            };
            room.members.retain(|member| member != id);

            let peers: Vec<ClientSender> = room
                .members
                .iter()
                .filter_map(|member| clients.get(member).map(|peer| peer.sender.clone()))
                .collect();
            (room_name, peers)
        };

        tracing::info!("Client {} left room {}", id, room_name);

        let notice = ServerEvent::RemovePeerConnected {
            socket_id: id.to_string(),
        };
        for sender in peers {
            self.deliver(&sender, &notice).await;
        }
    }

    /// Forward an addressed event from `source` to its target. Unknown
    /// targets are ignored.
    pub async fn relay(&self, source: &str, event: ClientEvent) {
        let Some(target) = event.target().map(str::to_string) else {
            return;
        };

        let sender = {
            let state = self.state.read().await;
            state.clients.get(&target).map(|client| client.sender.clone())
        };
        let Some(sender) = sender else {
            tracing::debug!("Dropping message from {} to unknown peer {}", source, target);
            return;
        };

        let source_id = source.to_string();
        let message = match event {
            ClientEvent::SendOffer { sdp, .. } => ServerEvent::ReceiveOffer {
                source_id,
                target_id: target.clone(),
                sdp,
            },
            ClientEvent::SendAnswer { sdp, .. } => ServerEvent::ReceiveAnswer {
                source_id,
                target_id: target.clone(),
                sdp,
            },
            ClientEvent::SendIceCandidate {
                label, candidate, ..
            } => ServerEvent::ReceiveIceCandidate {
                source_id,
                target_id: target.clone(),
                label,
                candidate,
            },
            ClientEvent::JoinRoom { .. } => return,
        };

        if !self.deliver(&sender, &message).await {
            tracing::debug!("Peer {} unreachable, message from {} dropped", target, source);
        }
    }

    /// Dispatch one event received from client `id`
    pub async fn handle(&self, id: &str, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { room } => self.join_room(id, &room).await,
            event => self.relay(id, event).await,
        }
    }

    /// Queue `event` on a client's outbound queue. Returns false if the
    /// queue stayed full for the write timeout or the client is gone.
    async fn deliver(&self, sender: &ClientSender, event: &ServerEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };

        sender.send_timeout(json, self.write_wait).await.is_ok()
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.state.read().await.clients.contains_key(id)
    }

    /// Room a client is currently in
    pub async fn room_of(&self, id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .clients
            .get(id)
            .and_then(|client| client.room.clone())
    }

    /// Members of a room in join order
    pub async fn room_members(&self, room_name: &str) -> Option<Vec<String>> {
        self.state
            .read()
            .await
            .rooms
            .get(room_name)
            .map(|room| room.members.clone())
    }

    pub async fn room_stream_id(&self, room_name: &str) -> Option<String> {
        self.state
            .read()
            .await
            .rooms
            .get(room_name)
            .map(|room| room.stream_id.clone())
    }
}
