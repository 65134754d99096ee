//! Session descriptions exchanged over the `create` / `join` endpoints
//!
//! Browsers post their local description as JSON (`{"type":"offer","sdp":...}`).
//! Answers go back base64-encoded so they can be pasted around as a single
//! opaque token. Decoding accepts either form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Base64 of the JSON form
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode a request body holding either raw JSON or its base64 encoding
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let trimmed = body.trim_ascii();
        if trimmed.is_empty() {
            return Err(ProtocolError::Empty);
        }

        if trimmed.first() == Some(&b'{') {
            return Ok(serde_json::from_slice(trimmed)?);
        }

        let json = STANDARD.decode(trimmed)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_json() {
        let body = br#"{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"}"#;
        let desc = SessionDescription::decode(body).unwrap();
        assert_eq!(desc.sdp_type, SdpType::Offer);
        assert!(desc.sdp.starts_with("v=0"));
    }

    #[test]
    fn test_decode_base64_answer_from_encode() {
        let answer = SessionDescription::answer("v=0\r\n");
        let token = answer.encode().unwrap();
        assert!(!token.contains('{'));

        let decoded = SessionDescription::decode(format!("{}\n", token).as_bytes()).unwrap();
        assert_eq!(decoded, answer);
    }

    #[test]
    fn test_decode_rejects_empty_and_garbage() {
        assert!(matches!(
            SessionDescription::decode(b"   "),
            Err(ProtocolError::Empty)
        ));
        assert!(SessionDescription::decode(b"%%%").is_err());
        assert!(SessionDescription::decode(br#"{"type":"bogus","sdp":""}"#).is_err());
    }
}
