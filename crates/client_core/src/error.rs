use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport worker has stopped")]
    Closed,
    #[error("outbound frame queue is full")]
    Backpressure,
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Socket(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("failed to send message: {reason}")]
    Send { reason: String },
    #[error("request failed: {0:#}")]
    Fetch(#[from] anyhow::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session already connected")]
    AlreadyConnected,
    #[error("session has been shut down")]
    SessionClosed,
}
