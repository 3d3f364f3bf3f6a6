//! Error types for the layer stack.
//!
//! Network and protocol failures are not errors in this sense: they travel as
//! completion replies, flow errors or synthetic HTTP responses. [`LayerError`]
//! is reserved for broken layer composition, which must fail loudly.

use thiserror::Error;

use crate::layer::LayerKind;

/// Layer contract violation.
#[derive(Debug, Error)]
pub enum LayerError {
    /// An event arrived that the current state does not accept.
    #[error("{layer}: unexpected event in state {state}: {event}")]
    UnexpectedEvent {
        layer: LayerKind,
        state: &'static str,
        event: String,
    },

    /// A reply did not match the kind of command it completes.
    #[error("{layer}: reply {reply} does not match pending {expected}")]
    UnexpectedReply {
        layer: LayerKind,
        expected: &'static str,
        reply: String,
    },

    /// A blocking command was followed by further commands in one emission.
    #[error("{0}: blocking command must be the last command emitted")]
    BlockingNotLast(LayerKind),

    /// The layer requires a specific parent layer kind.
    #[error("{layer} requires a {required} parent, found {found:?}")]
    MissingParent {
        layer: LayerKind,
        required: LayerKind,
        found: Option<LayerKind>,
    },

    /// An HTTP stream or connection handle was referenced but is unknown.
    #[error("unknown http {0}")]
    UnknownHttpTarget(String),
}

/// TLS handshake failure, classified for display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsError {
    /// Peer certificate was rejected by local verification.
    #[error("Certificate verify failed: {0}")]
    CertificateVerifyFailed(String),

    /// Peer sent a fatal alert.
    #[error("Received alert: {0}")]
    Alert(String),

    /// Bytes on the wire were not TLS records.
    #[error("Not a TLS connection")]
    NotTls,

    /// Anything else the engine reported.
    #[error("{0}")]
    Other(String),
}

impl TlsError {
    /// Classifies an engine error description.
    pub fn classify(error_text: &str) -> Self {
        let lower = error_text.to_ascii_lowercase();

        if contains_any(&lower, &["unknown ca", "unknownca", "unknown_ca"]) {
            return Self::Alert("unknown ca".to_string());
        }
        if contains_any(&lower, &["bad certificate", "badcertificate", "bad_certificate"]) {
            return Self::Alert("bad certificate".to_string());
        }
        if contains_any(
            &lower,
            &[
                "invalid peer certificate",
                "certificate verify failed",
                "unknownissuer",
                "notvalidforname",
                "expired",
            ],
        ) {
            return Self::CertificateVerifyFailed(error_text.to_string());
        }
        if contains_any(&lower, &["corrupt message", "invalidcontenttype", "not tls"]) {
            return Self::NotTls;
        }

        Self::Other(error_text.to_string())
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Result type for layer operations.
pub type Result<T> = std::result::Result<T, LayerError>;
