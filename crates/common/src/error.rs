//! Common error types for the VRRP workspace.

use std::fmt;

/// A specialized Result type for VRRP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet error: {0}")]
    Packet(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("announce error: {0}")]
    Announce(String),

    #[error("interface error: {0}")]
    Interface(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new packet error.
    pub fn packet(msg: impl fmt::Display) -> Self {
        Error::Packet(msg.to_string())
    }

    /// Create a new socket error.
    pub fn socket(msg: impl fmt::Display) -> Self {
        Error::Socket(msg.to_string())
    }

    /// Create a new announce error.
    pub fn announce(msg: impl fmt::Display) -> Self {
        Error::Announce(msg.to_string())
    }

    /// Create a new interface error.
    pub fn interface(msg: impl fmt::Display) -> Self {
        Error::Interface(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new uncategorized error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
