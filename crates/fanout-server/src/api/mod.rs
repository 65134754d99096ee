mod ice;
mod sfu;

pub use self::sfu::{ROOM_ID_HEADER, RoomsResponse};

use crate::signaling;
use crate::state::AppState;
use crate::transport::MediaTransport;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router<T: MediaTransport>(state: AppState<T>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(ROOM_ID_HEADER)]);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // SFU
        .route("/create", post(sfu::create::<T>))
        .route("/join/{room_id}", post(sfu::join::<T>))
        .route("/rooms", get(sfu::list_rooms::<T>))
        .route("/ice-servers", get(ice::get_ice_servers::<T>))
        // Mesh signaling
        .route("/ws", get(signaling::ws_handler::<T>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
