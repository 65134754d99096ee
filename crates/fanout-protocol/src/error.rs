use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Empty session description")]
    Empty,
}
