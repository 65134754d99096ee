//! Fanout server library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod sfu;
pub mod signaling;
pub mod state;
pub mod transport;

use anyhow::Result;
use std::sync::Arc;
use transport::{MediaTransport, WebRtcTransport};

/// Build the application on the webrtc-rs transport
pub fn create_app(config: state::Config) -> Result<axum::Router> {
    let transport = WebRtcTransport::new(&config.stun_servers, &config.turn_servers)?;
    Ok(create_app_with_transport(config, Arc::new(transport)))
}

/// Build the application on any transport
pub fn create_app_with_transport<T: MediaTransport>(
    config: state::Config,
    transport: Arc<T>,
) -> axum::Router {
    let state = state::AppState::new(config, transport);
    api::create_router(state)
}
