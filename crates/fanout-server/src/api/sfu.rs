//! Publish and subscribe endpoints
//!
//! Request bodies carry the peer's offer as JSON or base64 JSON; responses
//! carry the base64 encoded answer.

use crate::error::{AppError, Result};
use crate::sfu::RoomId;
use crate::state::AppState;
use crate::transport::MediaTransport;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    response::IntoResponse,
};
use fanout_protocol::{SdpType, SessionDescription};
use serde::Serialize;

pub const ROOM_ID_HEADER: &str = "x-room-id";

fn decode_offer(body: &[u8]) -> Result<SessionDescription> {
    let offer = SessionDescription::decode(body)?;
    if offer.sdp_type != SdpType::Offer {
        return Err(AppError::BadRequest(format!(
            "Expected an offer, got {:?}",
            offer.sdp_type
        )));
    }
    Ok(offer)
}

/// Start publishing: opens a room and answers the publisher's offer
pub async fn create<T: MediaTransport>(
    State(state): State<AppState<T>>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let offer = decode_offer(&body)?;
    let (room_id, answer) = state.sfu.publish(offer).await?;

    tracing::info!("Publisher connected to room {}", room_id);

    Ok(([(ROOM_ID_HEADER, room_id.to_string())], answer.encode()?))
}

/// Subscribe to a room's relay tracks
pub async fn join<T: MediaTransport>(
    State(state): State<AppState<T>>,
    Path(room_id): Path<RoomId>,
    body: Bytes,
) -> Result<String> {
    let offer = decode_offer(&body)?;
    let answer = state.sfu.join(room_id, offer).await?;
    Ok(answer.encode()?)
}

#[derive(Debug, Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomId>,
}

pub async fn list_rooms<T: MediaTransport>(
    State(state): State<AppState<T>>,
) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: state.sfu.room_ids().await,
    })
}
