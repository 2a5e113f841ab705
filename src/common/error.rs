//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// Connect proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// TLS handshake error
    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// Certificate error
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The proxied service identity could not be established
    #[error("Identity error: {0}")]
    Identity(String),

    /// Request to the control plane failed
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::ControlPlane(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
