use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// The raw frame every signaling message travels in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_name: String,
    #[serde(default)]
    pub data: Value,
}

/// Messages sent from a peer to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join (or create) a named room
    JoinRoom {
        #[serde(default)]
        room: String,
    },

    /// Session offer addressed to another peer
    SendOffer {
        #[serde(rename = "socketId")]
        socket_id: String,
        #[serde(default)]
        sdp: Value,
    },

    /// Session answer addressed to another peer
    SendAnswer {
        #[serde(rename = "socketId")]
        socket_id: String,
        #[serde(default)]
        sdp: Value,
    },

    /// Connectivity candidate addressed to another peer
    SendIceCandidate {
        #[serde(rename = "socketId")]
        socket_id: String,
        #[serde(default)]
        label: Value,
        #[serde(default)]
        candidate: Value,
    },
}

impl ClientEvent {
    pub const JOIN_ROOM: &'static str = "join_room";
    pub const SEND_OFFER: &'static str = "send_offer";
    pub const SEND_ANSWER: &'static str = "send_answer";
    pub const SEND_ICE_CANDIDATE: &'static str = "send_ice_candidate";

    /// Parse one inbound text frame.
    ///
    /// Returns `Ok(None)` for event names this server does not handle; peers
    /// are free to send events meant for other deployments and those are
    /// dropped without closing the session. A recognized event with a payload
    /// of the wrong shape is an error.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        match envelope.event_name.as_str() {
            Self::JOIN_ROOM | Self::SEND_OFFER | Self::SEND_ANSWER | Self::SEND_ICE_CANDIDATE => {
                let event = serde_json::from_value(serde_json::to_value(envelope)?)?;
                Ok(Some(event))
            }
            _ => Ok(None),
        }
    }

    /// Peer the event is addressed to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinRoom { .. } => None,
            ClientEvent::SendOffer { socket_id, .. }
            | ClientEvent::SendAnswer { socket_id, .. }
            | ClientEvent::SendIceCandidate { socket_id, .. } => Some(socket_id),
        }
    }
}

/// Messages sent from the signaling server to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Another peer joined the room
    NewPeerConnected {
        #[serde(rename = "socketId")]
        socket_id: String,
    },

    /// A room-mate's session ended
    RemovePeerConnected {
        #[serde(rename = "socketId")]
        socket_id: String,
    },

    /// Reply to `join_room`: who is already here and who you are
    GetPeers {
        connections: Vec<String>,
        you: String,
        stream_id: String,
    },

    ReceiveOffer {
        source_id: String,
        target_id: String,
        sdp: Value,
    },

    ReceiveAnswer {
        source_id: String,
        target_id: String,
        sdp: Value,
    },

    ReceiveIceCandidate {
        source_id: String,
        target_id: String,
        label: Value,
        candidate: Value,
    },
}
