//! Error types for the causeway engine.

use thiserror::Error;

/// Result type alias using the engine's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A peer with this id is already registered.
    #[error("peer {0} already exists")]
    PeerExists(String),

    /// The engine has been closed; no further operations are accepted.
    #[error("engine closed")]
    Closed,

    /// The signaling exchange failed (bad status, missing fields, protocol
    /// violation).
    #[error("signaling error: {0}")]
    Signaling(String),

    /// A peer id that must be a signaling URL is not one.
    #[error("invalid peer url {0:?}")]
    InvalidPeerUrl(String),

    /// Configuration error (unknown credential scheme, invalid address).
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the WebRTC engine.
    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),

    /// HTTP transport error while signaling.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Wire decode error.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error (socket bind, stream framing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
