//! Error types for the Tessera coordinator
//!
//! This module contains the error taxonomy used throughout party formation and
//! signing orchestration: transport/stream errors, session bookkeeping errors,
//! coordination outcomes that carry the partial online peer list, decode
//! errors, and the `TesseraError` type that unifies them all.

use crate::request::Blame;
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Stream and transport level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to open stream to peer {peer_id}: {reason}")]
    OpenFailed { peer_id: String, reason: String },
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stream deadline exceeded after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Payload length {length} exceeds max payload length {max}")]
    PayloadTooLarge { length: usize, max: usize },
    #[error("Stream to peer {peer_id} is closed")]
    Closed { peer_id: String },
    #[error("Memory reservation of {requested} bytes refused: {reason}")]
    MemoryReservation { requested: usize, reason: String },
    #[error("Peer {peer_id} does not handle protocol {protocol}")]
    ProtocolNotSupported { peer_id: String, protocol: String },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
}

/// Session registry and per-session bookkeeping failures
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {session_id} already exists")]
    SessionAlreadyExists { session_id: String },
    #[error("Peer {peer_id} is not expected in session {session_id}")]
    UnknownPeer { session_id: String, peer_id: String },
}

/// Terminal outcomes of a failed party formation
///
/// Variants that know which peers were online carry that list so the caller can
/// attribute blame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    #[error("Fail to join party, timeout (online: [{}])", join_peers(.online))]
    JoinTimeout { online: Vec<PeerId> },
    #[error("Leader {leader} not reachable")]
    LeaderUnreachable { leader: PeerId },
    #[error("Not enough peers: {} online, {required} required", .online.len())]
    InsufficientPeers { online: Vec<PeerId>, required: usize },
    #[error("Peer set is empty")]
    EmptyPeerSet,
}

impl CoordinationError {
    /// Peers known to be online when the formation failed, if any
    pub fn online_peers(&self) -> Option<&[PeerId]> {
        match self {
            CoordinationError::JoinTimeout { online }
            | CoordinationError::InsufficientPeers { online, .. } => Some(online),
            CoordinationError::LeaderUnreachable { .. } | CoordinationError::EmptyPeerSet => None,
        }
    }
}

/// Malformed peer identifiers or protocol messages
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Fail to decode peer id({input}): {reason}")]
    InvalidPeerId { input: String, reason: String },
    #[error("Malformed binary message: {0}")]
    Binary(#[from] bincode::Error),
    #[error("Malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed message: {reason}")]
    Message { reason: String },
}

/// Failures reported by the signing side of a request
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("Signing engine failed: {reason}")]
    Engine { reason: String },
    #[error("Signature notification failed: {reason}")]
    Notification { reason: String },
    #[error("Signing failed, blaming {} peers", .blame.blame_nodes.len())]
    Blamed { blame: Blame },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the Tessera coordinator
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl From<bincode::Error> for TesseraError {
    fn from(err: bincode::Error) -> Self {
        TesseraError::Decode(DecodeError::Binary(err))
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        TesseraError::Decode(DecodeError::Json(err))
    }
}

impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        TesseraError::Transport(TransportError::Io(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TesseraError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TesseraError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a malformed message error
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        TesseraError::Decode(DecodeError::Message {
            reason: reason.into(),
        })
    }

    /// Create a stream open failure
    pub fn open_failed<P: ToString, R: Into<String>>(peer_id: P, reason: R) -> Self {
        TesseraError::Transport(TransportError::OpenFailed {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        })
    }

    /// Create an invalid request error
    pub fn invalid_request<T: Into<String>>(reason: T) -> Self {
        TesseraError::Signing(SigningError::InvalidRequest {
            reason: reason.into(),
        })
    }

    /// Create a signing engine error
    pub fn engine_error<T: Into<String>>(reason: T) -> Self {
        TesseraError::Signing(SigningError::Engine {
            reason: reason.into(),
        })
    }

    /// Peers known to be online when a party formation failed
    pub fn online_peers(&self) -> Option<&[PeerId]> {
        match self {
            TesseraError::Coordination(err) => err.online_peers(),
            _ => None,
        }
    }

    /// Whether the error is a stream deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TesseraError::Transport(TransportError::Timeout { .. })
                | TesseraError::Coordination(CoordinationError::JoinTimeout { .. })
        )
    }
}

fn join_peers(peers: &[PeerId]) -> String {
    peers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, TesseraError>;
pub type TesseraResult<T> = Result<T>;
