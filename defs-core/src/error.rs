//! Error types for DEFS
//!
//! Provides a unified error type for all DEFS operations. Variant names are
//! stable and double as the observability taxonomy (see [`DefsError::kind`]).

use thiserror::Error;

/// Result type alias for DEFS operations
pub type Result<T> = std::result::Result<T, DefsError>;

/// Unified error type for DEFS
#[derive(Error, Debug)]
pub enum DefsError {
    // ===== Type Codec Errors =====
    #[error("Invalid length for {type_name}: expected {expected}, got {actual}")]
    InvalidLength {
        type_name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported type tag: {0}")]
    UnsupportedType(u8),

    // ===== Segmented Object Errors =====
    #[error("No such field: {0}")]
    NoSuchField(String),

    #[error("Corrupt segment: {0}")]
    Corrupt(String),

    #[error("Cross-reference table not found")]
    XrefNotFound,

    #[error("Invalid segment name: {0}")]
    InvalidSegmentName(String),

    // ===== Erasure Coding Errors =====
    #[error("Shard count out of range: data={data}, parity={parity}")]
    ShardCountOutOfRange { data: usize, parity: usize },

    #[error("Insufficient shards to reconstruct: have {available}, need {required}")]
    ReconstructInsufficient { available: usize, required: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    // ===== Network Errors =====
    #[error("Handshake failed after {attempts} attempts: {cause}")]
    HandshakeFailed { attempts: u32, cause: String },

    #[error("Stream timed out")]
    StreamTimeout,

    #[error("Stream reset: {0}")]
    StreamReset(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    // ===== Pipeline Errors =====
    #[error("File paused: {0}")]
    Paused(String),

    // ===== Authentication Errors =====
    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Script rejected: {0}")]
    ScriptRejected(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ===== Lifecycle =====
    #[error("Operation cancelled")]
    Cancelled,

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DefsError {
    /// Stable taxonomy name used in structured logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidLength { .. } => "InvalidLength",
            Self::UnsupportedType(_) => "UnsupportedType",
            Self::NoSuchField(_) => "NoSuchField",
            Self::Corrupt(_) => "Corrupt",
            Self::XrefNotFound => "XrefNotFound",
            Self::InvalidSegmentName(_) => "InvalidSegmentName",
            Self::ShardCountOutOfRange { .. } => "ShardCountOutOfRange",
            Self::ReconstructInsufficient { .. } => "ReconstructInsufficient",
            Self::ShardSizeMismatch { .. } => "ShardSizeMismatch",
            Self::ErasureCoding(_) => "ErasureCoding",
            Self::HandshakeFailed { .. } => "HandshakeFailed",
            Self::StreamTimeout => "StreamTimeout",
            Self::StreamReset(_) => "StreamReset",
            Self::MessageTooLarge { .. } => "MessageTooLarge",
            Self::PeerNotFound(_) => "PeerNotFound",
            Self::Network(_) => "Network",
            Self::Paused(_) => "Paused",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::ScriptRejected(_) => "ScriptRejected",
            Self::InvalidKey(_) => "InvalidKey",
            Self::InvalidAddress(_) => "InvalidAddress",
            Self::Cancelled => "Cancelled",
            Self::Storage(_) => "Storage",
            Self::Io(_) => "Io",
            Self::Serialization(_) => "Serialization",
            Self::Configuration(_) => "Configuration",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether the error is worth retrying locally within a stream budget
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StreamTimeout | Self::StreamReset(_))
    }

    /// Map a raw I/O error from a network stream into the taxonomy.
    pub fn from_stream_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::StreamTimeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::StreamReset(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

impl From<reed_solomon_erasure::Error> for DefsError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        match err {
            reed_solomon_erasure::Error::TooFewShardsPresent => {
                // The coder does not report counts; callers that know them
                // construct ReconstructInsufficient themselves.
                DefsError::ReconstructInsufficient {
                    available: 0,
                    required: 0,
                }
            }
            other => DefsError::ErasureCoding(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DefsError {
    fn from(err: serde_json::Error) -> Self {
        DefsError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DefsError::ReconstructInsufficient {
            available: 3,
            required: 4,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient shards to reconstruct: have 3, need 4"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DefsError = io_err.into();
        assert!(matches!(err, DefsError::Io(_)));
        assert_eq!(err.kind(), "Io");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DefsError::StreamTimeout.is_transient());
        assert!(DefsError::StreamReset("reset".into()).is_transient());
        assert!(!DefsError::Cancelled.is_transient());
        assert!(!DefsError::MessageTooLarge { size: 2, max: 1 }.is_transient());
    }

    #[test]
    fn test_stream_io_mapping() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            DefsError::from_stream_io(timeout),
            DefsError::StreamTimeout
        ));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "gone");
        assert!(matches!(
            DefsError::from_stream_io(reset),
            DefsError::StreamReset(_)
        ));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(DefsError::from_stream_io(other), DefsError::Io(_)));
    }
}
