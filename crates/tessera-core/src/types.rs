//! Core types for the Tessera coordinator
//!
//! This module defines the identifiers shared by every layer: peer ids, protocol
//! identifiers and the well-known session bucket for unattributed streams.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, TesseraError};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a node in the signing cluster
///
/// The canonical textual form is 16 lowercase hex characters. Peer sets are
/// ordered by the raw bytes, which matches the lexicographic order of the
/// canonical text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Create a new PeerId from 8 bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);

        let bytes = hex::decode(clean_str).map_err(|e| DecodeError::InvalidPeerId {
            input: s.to_string(),
            reason: e.to_string(),
        })?;

        let id: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::InvalidPeerId {
                input: s.to_string(),
                reason: format!("expected 8 bytes, got {}", bytes.len()),
            })?;

        Ok(Self(id))
    }
}

/// Decode a list of textual peer ids, failing on the first malformed entry
pub fn decode_peer_ids<S: AsRef<str>>(input: &[S]) -> Result<Vec<PeerId>, TesseraError> {
    input.iter().map(|s| s.as_ref().parse()).collect()
}

/// Sort and de-duplicate a peer list into canonical order
pub fn canonical_peers(peers: &[PeerId]) -> Vec<PeerId> {
    let mut out = peers.to_vec();
    out.sort();
    out.dedup();
    out
}

// ----------------------------------------------------------------------------
// Protocol Identifiers
// ----------------------------------------------------------------------------

/// Stream protocol identifier used to route inbound streams to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    /// Leaderless join-party requests
    JoinParty,
    /// Leader-directed join-party requests and decisions
    JoinPartyLeader,
    /// General signing/keygen message stream
    Tss,
}

impl ProtocolId {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::JoinParty => "/p2p/join-party",
            ProtocolId::JoinPartyLeader => "/p2p/join-party-leader",
            ProtocolId::Tss => "/p2p/tss",
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Session Identifiers
// ----------------------------------------------------------------------------

/// Bucket for streams whose message could not be decoded or attributed
pub const UNKNOWN_SESSION: &str = "UNKNOWN";
