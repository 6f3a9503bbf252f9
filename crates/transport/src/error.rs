use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Session handshake failed: {0}")]
    Handshake(String),

    #[error("Connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("Connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Crypto setup failed: {0}")]
    Crypto(String),

    #[error("Invalid transport config: {0}")]
    Config(String),

    #[error("Transport timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;
