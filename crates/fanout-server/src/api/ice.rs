use crate::state::AppState;
use crate::transport::MediaTransport;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

/// ICE servers browsers should use for their side of the relay and mesh
/// connections
pub async fn get_ice_servers<T: MediaTransport>(
    State(state): State<AppState<T>>,
) -> Json<IceServersResponse> {
    let stun = state.config.stun_servers.iter().map(|url| IceServer {
        urls: vec![url.clone()],
        username: None,
        credential: None,
    });

    let turn = state.config.turn_servers.iter().map(|turn| IceServer {
        urls: vec![turn.url.clone()],
        username: Some(turn.username.clone()),
        credential: Some(turn.credential.clone()),
    });

    Json(IceServersResponse {
        ice_servers: stun.chain(turn).collect(),
    })
}
