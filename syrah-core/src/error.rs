//! Error types for bridge and proxy operations

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the bridge and the proxy it is attached to.
///
/// Only [`BridgeError::Bind`] and the proxy startup variants are meant to
/// reach the process owner; everything that happens while traffic is flowing
/// is logged where it occurs and never propagated.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The control bridge could not bind its listening socket
    #[error("Failed to bind bridge on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Certificate-related errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The interception engine failed
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Control server failed after it was started
    #[error("Bridge server error: {0}")]
    Server(String),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Returned by [`crate::InterceptionRegistry::register`] when the id is already held.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("flow {0} is already held")]
    AlreadyHeld(String),
}

/// Failure to turn an inbound client message into a [`crate::codec::Command`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not valid JSON, not an object, or fields of the wrong type
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Well-formed message with a command name nobody handles
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Failure while loading a map-local file. Never fatal: the original
/// response is kept.
#[derive(Debug, Error)]
pub enum MapLocalError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reading {path} took longer than {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
}
