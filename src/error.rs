//! Error types for paqet

use thiserror::Error;

/// Main error type for paqet
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("License error: {0}")]
    License(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Packet error: {0}")]
    Packet(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for paqet
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            Error::ConnectionClosed => {
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "connection closed")
            }
            Error::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"),
            other => std::io::Error::other(other.to_string()),
        }
    }
}
