//! Error types for sudokium

use thiserror::Error;

/// Main error type for the Sudoku transport stack
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("invalid sudoku hint sequence: no table entry")]
    DecodeMapMiss,

    #[error("handshake timestamp skew detected")]
    TimestampSkew,

    #[error("downlink mode mismatch: client={client:#04x} server={server:#04x}")]
    DownlinkModeMismatch { client: u8, server: u8 },

    #[error("table probe failed: no candidate table decodes the handshake")]
    TableProbeFailed,

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for sudokium
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map into an `std::io::Error` for use inside AsyncRead/AsyncWrite impls.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Error::Io(e) => e,
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"),
            Error::ConnectionClosed => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed")
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
