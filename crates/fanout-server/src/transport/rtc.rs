//! webrtc-rs implementation of the transport traits

use super::{
    CodecInfo, InboundTrack, MediaKind, MediaTransport, OutboundTrack, PublishSession,
    PublisherLink, TrackInfo, TransportError,
};
use crate::state::TurnServer;
use anyhow::Result;
use async_trait::async_trait;
use fanout_protocol::SessionDescription;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Inbound tracks buffered between `on_track` and the room supervisor
const TRACK_QUEUE: usize = 4;

/// Peer connections negotiated through the webrtc-rs stack
pub struct WebRtcTransport {
    /// WebRTC API (shared for all connections)
    api: API,
    ice_servers: Vec<RTCIceServer>,
    /// Subscriber connections, kept alive until they close or fail
    subscribers: Arc<Mutex<HashMap<Uuid, Arc<RTCPeerConnection>>>>,
}

impl WebRtcTransport {
    pub fn new(stun_servers: &[String], turn_servers: &[TurnServer]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        // packetization-mode=1 keeps FU-A fragments intact when relayed
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let mut ice_servers = vec![];

        for stun_url in stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Ok(Self {
            api,
            ice_servers,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        Ok(Arc::new(self.api.new_peer_connection(config).await?))
    }

    /// Number of subscriber connections currently alive
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Apply a remote offer and produce a complete (non-trickle) answer
async fn negotiate(
    pc: &RTCPeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription, TransportError> {
    let offer = RTCSessionDescription::offer(offer.sdp)
        .map_err(|e| TransportError::Negotiation(e.to_string()))?;
    pc.set_remote_description(offer)
        .await
        .map_err(|e| TransportError::Negotiation(e.to_string()))?;

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|e| TransportError::Negotiation(e.to_string()))?;

    // Browsers post one description and never trickle, so wait for every
    // candidate to be in the answer
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))?;

    Ok(SessionDescription::answer(local.sdp))
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    type Publisher = WebRtcPublisher;
    type Inbound = WebRtcInbound;
    type Outbound = WebRtcOutbound;

    async fn accept_publisher(
        &self,
        offer: SessionDescription,
    ) -> Result<PublishSession<WebRtcPublisher, WebRtcInbound>, TransportError> {
        let pc = self.new_peer_connection().await?;

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let (track_tx, track_rx) = mpsc::channel(TRACK_QUEUE);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            tracing::info!(
                "Publisher track active: kind={} ssrc={} codec={}",
                track.kind(),
                track.ssrc(),
                track.codec().capability.mime_type
            );
            Box::pin(async move {
                if track_tx.send(WebRtcInbound { track }).await.is_err() {
                    tracing::debug!("Room is gone, dropping inbound track");
                }
            })
        }));

        let (closed_tx, closed_rx) = watch::channel(false);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::debug!("Publisher connection state: {}", s);
            if matches!(
                s,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = closed_tx.send(true);
            }
            Box::pin(async {})
        }));

        let answer = match negotiate(&pc, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    tracing::debug!("Error closing failed publisher connection: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(PublishSession {
            answer,
            publisher: WebRtcPublisher {
                pc,
                closed: closed_rx,
            },
            tracks: track_rx,
        })
    }

    fn create_outbound_track(
        &self,
        info: &TrackInfo,
        stream_label: &str,
    ) -> Result<Arc<WebRtcOutbound>, TransportError> {
        let capability = RTCRtpCodecCapability {
            mime_type: info.codec.mime_type.clone(),
            clock_rate: info.codec.clock_rate,
            channels: info.codec.channels,
            sdp_fmtp_line: info.codec.sdp_fmtp_line.clone(),
            rtcp_feedback: vec![],
        };

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            info.kind.to_string(),
            stream_label.to_string(),
        ));

        Ok(Arc::new(WebRtcOutbound {
            track,
            kind: info.kind,
        }))
    }

    async fn accept_subscriber(
        &self,
        offer: SessionDescription,
        tracks: Vec<Arc<WebRtcOutbound>>,
    ) -> Result<SessionDescription, TransportError> {
        let pc = self.new_peer_connection().await?;
        let subscriber_id = Uuid::new_v4();

        for outbound in &tracks {
            let local: Arc<dyn TrackLocal + Send + Sync> = outbound.track.clone();
            let sender = match pc.add_track(local).await {
                Ok(sender) => sender,
                Err(e) => {
                    let _ = pc.close().await;
                    return Err(e.into());
                }
            };

            // Drain RTCP so the interceptors (NACK, reports) keep running
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let subscribers = self.subscribers.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if matches!(
                s,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let removed = subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&subscriber_id);
                if let Some(pc) = removed {
                    tracing::info!("Subscriber {} disconnected ({})", subscriber_id, s);
                    tokio::spawn(async move {
                        let _ = pc.close().await;
                    });
                }
            }
            Box::pin(async {})
        }));

        let answer = match negotiate(&pc, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber_id, pc);

        Ok(answer)
    }
}

pub struct WebRtcPublisher {
    pc: Arc<RTCPeerConnection>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl PublisherLink for WebRtcPublisher {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<(), TransportError> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcInbound {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInbound {
    fn info(&self) -> TrackInfo {
        let codec = self.track.codec().capability;
        TrackInfo {
            kind: match self.track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            },
            ssrc: self.track.ssrc(),
            payload_type: self.track.payload_type(),
            codec: CodecInfo {
                mime_type: codec.mime_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                sdp_fmtp_line: codec.sdp_fmtp_line,
            },
        }
    }

    async fn read_packet(&self) -> Result<Packet, TransportError> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet)
    }
}

pub struct WebRtcOutbound {
    track: Arc<TrackLocalStaticRTP>,
    kind: MediaKind,
}

#[async_trait]
impl OutboundTrack for WebRtcOutbound {
    fn id(&self) -> &str {
        self.track.id()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        // write_rtp fans out to every binding and folds per-binding failures
        // into one error; bindings that did not fail already got the packet.
        self.track
            .write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SubscriberWrite(e.to_string()))
    }
}
