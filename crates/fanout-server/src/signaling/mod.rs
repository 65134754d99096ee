//! Mesh signaling over WebSocket
//!
//! Peers join named rooms and exchange offers, answers and ICE candidates
//! with each other through the hub. Media never flows through here.

mod hub;
mod session;

pub use hub::{ClientSender, SignalingHub};
pub use session::{serve, ws_handler};

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SignalingSettings {
    /// Read deadline, reset by every inbound frame (pongs included)
    pub pong_wait: Duration,
    /// Deadline for a single socket write, and for queueing a message on a
    /// peer's outbound queue
    pub write_wait: Duration,
    pub max_message_size: usize,
    pub send_queue_capacity: usize,
}

impl SignalingSettings {
    /// Pings go out a little more often than the peer's read deadline
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 65535,
            send_queue_capacity: 256,
        }
    }
}
