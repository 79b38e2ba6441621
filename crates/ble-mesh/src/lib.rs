//! Bluetooth Mesh network & transport engine
//!
//! This crate turns typed access messages into encrypted, segmented Network PDUs
//! for an unreliable low-MTU bearer, and reassembles and decrypts inbound PDUs
//! back into typed messages. Acknowledged messages become awaitable requests with
//! retries, timeouts and cancellation.

pub mod address;
pub mod bearer;
pub mod correlator;
pub mod crypto;
pub mod engine;
pub mod error;
mod inbound;
pub mod keys;
pub mod message;
pub mod messages;
pub mod network;
pub mod outbound;
pub mod pdu;
pub mod replay;
pub mod segmentation;
pub mod sequence;
pub mod stats;
pub mod storage;

// Re-export main types
pub use address::{Address, AddressKind, MeshAddress};
pub use bearer::{Bearer, ChannelBearer, RecordingBearer};
pub use engine::{NetworkEngine, NetworkEngineBuilder};
pub use error::{MeshError, MeshResult};
pub use keys::{KeyIndex, KeyRefreshPhase, KeyStore};
pub use message::{
    DecodedMessage, MeshMessage, MessageKey, MessageRegistry, MessageSecurity, Opcode,
    ReceivedMessage, StaticMeshMessage,
};
pub use network::{ElementConfig, ModelConfig, NetworkConfigProvider, NodeConfig, StaticNetwork};
pub use outbound::{MessageHandle, OutboundState, SendOutcome};
pub use sequence::IvIndex;
pub use stats::{DropReason, StatsSnapshot};
pub use storage::{FileStateStore, InMemoryStateStore, StateStore};
pub use shared::TransportConfig;
