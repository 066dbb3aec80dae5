//! Error types for the recognition transport

/// Errors raised while establishing the recognition channel
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection refused by server: {0}")]
    ConnectionRefused(String),

    #[error("Connection timeout - server did not respond within {0} seconds")]
    ConnectionTimeout(u64),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),
}

/// Malformed or unsupported Engine.IO / Socket.IO packets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum CodecError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet type '{0}'")]
    UnknownPacketType(char),

    #[error("Invalid packet payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported packet: {0}")]
    Unsupported(&'static str),
}
