//! Tessera Harness
//!
//! Shared test infrastructure: an in-memory stream network implementing the
//! core transport contract, and deterministic signing, keygen, verification
//! and blame collaborators.

pub mod engines;
pub mod network;

pub use engines::{
    expected_signature, DigestVerifier, MockKeygenEngine, MockSigningEngine, SyncBlameManager,
};
pub use network::{
    MemoryMeter, MemoryNetwork, MemoryNetworkConfig, MemoryStream, MemoryTransport, NetworkStats,
};

use tessera_core::PeerId;

/// Peer id whose first byte is `id`
pub fn test_peer_id(id: u8) -> PeerId {
    PeerId::new([id, 0, 0, 0, 0, 0, 0, 0])
}
