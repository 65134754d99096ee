//! Shared protocol definitions for fanout
//!
//! - [`messages`]: the `{event_name, data}` mesh signaling events
//! - [`session`]: session description encoding used by the publish/join endpoints

pub mod error;
pub mod messages;
pub mod session;

pub use error::ProtocolError;
pub use messages::*;
pub use session::{SdpType, SessionDescription};
