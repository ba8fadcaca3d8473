//! Tessera Core
//!
//! Foundational types for coordinating threshold-signature parties: peer and
//! protocol identifiers, the error taxonomy, join-party and signing messages,
//! stream framing, the transport contract, requests and configuration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod errors;
pub mod protocol;
pub mod request;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{CoordinatorConfig, KeysignConfig, StreamConfig, TesseraConfig};
pub use engine::{BlameManager, KeygenEngine, SignatureNotifier, SignatureVerifier, SigningEngine};
pub use errors::{
    CoordinationError, DecodeError, Result, SessionError, SigningError, TesseraError, TesseraResult,
    TransportError,
};
pub use protocol::{
    Ack, JoinPartyLeaderComm, JoinPartyRequest, LeaderCommType, LeaderDecision, LeaderOutcome,
    SharedSignature, TssMessageType, WrappedMessage, MAX_PAYLOAD,
};
pub use request::{
    threshold, Blame, BlameReason, KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse,
    Signature, Status,
};
pub use transport::{
    FrameDeadline, MemoryScope, ReservationGuard, StreamHandle, Transport, TransportStream,
};
pub use types::{canonical_peers, decode_peer_ids, PeerId, ProtocolId, UNKNOWN_SESSION};
