use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Invalid pairing uri: {0}")]
    Uri(String),

    #[error("Encrypt failed: {0}")]
    Encode(String),

    #[error("Decrypt failed: {0}")]
    Decode(String),

    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("No relays configured")]
    NoRelays,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Remote signer pubkey not known yet")]
    SignerUnknown,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request queue shut down")]
    Shutdown,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),
}

impl Error {
    /// True for the encode/decode/unexpected-payload family.
    ///
    /// The incoming-event handler uses this to decide whether a failed
    /// response decode may fall back to a request decode.
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            Self::Encode(_) | Self::Decode(_) | Self::UnexpectedPayload(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
