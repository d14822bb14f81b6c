use op_core::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown transport kind: {0}")]
    UnknownKind(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("seal failure: {0}")]
    Seal(#[from] CryptoError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
