use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("frame payload of {0} bytes exceeds the 16 MiB cap")]
    PayloadTooLarge(u64),
    #[error("peer closed the connection")]
    UnexpectedEof,
}
