//! Error types for mesh network and transport operations

use crate::address::Address;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in the network & transport engine
///
/// Errors of caller-initiated operations are surfaced to the caller. Errors
/// raised while processing inbound PDUs (`Crypto`, `Replay`, `InvalidPdu`) never
/// leave the engine: the PDU is dropped and the failure is logged and counted.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(u8),

    #[error("Element {0} does not belong to the local node")]
    InvalidElement(Address),

    #[error("Key not bound: {0}")]
    KeyNotBound(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Replayed PDU from {source_address} (iv_index={iv_index}, seq={sequence})")]
    Replay {
        source_address: Address,
        iv_index: u32,
        sequence: u32,
    },

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Segmentation error: {0}")]
    Segmentation(String),

    #[error("Segments rejected by {0}")]
    SegmentsRejected(Address),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Sequence numbers exhausted for {0}, IV Index update required")]
    SequenceExhausted(Address),

    #[error("IV Index error: {0}")]
    IvIndex(String),

    #[error("Request already in flight: {0}")]
    DuplicateRequest(String),

    #[error("Too many pending requests (limit {0})")]
    TooManyPendingRequests(usize),

    #[error("Timed out waiting for acknowledgment")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("PDU transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Bearer closed")]
    BearerClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError(err.to_string())
    }
}

impl From<shared::ConfigError> for MeshError {
    fn from(err: shared::ConfigError) -> Self {
        MeshError::Configuration(err.to_string())
    }
}
