//! Driver error types.

use std::net::SocketAddr;

use thiserror::Error;

use strata_core::{LayerError, TlsError};

/// Certificate authority errors.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to read or write the CA files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to generate a key or certificate.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Failed to parse stored key material.
    #[error("parse failed: {0}")]
    Parse(String),
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// Socket error while serving a connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate authority error.
    #[error("certificate authority: {0}")]
    Ca(#[from] CaError),

    /// TLS configuration error.
    #[error("tls: {0}")]
    Tls(#[from] TlsError),

    /// The layer stack violated its contract; the connection is torn down.
    #[error("layer error: {0}")]
    Layer(#[from] LayerError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, ServerError>;
