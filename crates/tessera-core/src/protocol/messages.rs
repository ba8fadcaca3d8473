//! Protocol messages exchanged between nodes
//!
//! Join-party messages travel bincode encoded; the general signing stream uses
//! JSON `WrappedMessage` envelopes so engines can carry arbitrary payloads.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, Result};
use crate::request::Signature;
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Join Party Messages
// ----------------------------------------------------------------------------

/// Leaderless join request, also used by members contacting a leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPartyRequest {
    pub session_id: String,
}

impl JoinPartyRequest {
    pub fn new<S: Into<String>>(session_id: S) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(DecodeError::from)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes).map_err(DecodeError::from)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderCommType {
    /// Member asking to join
    Request,
    /// Leader announcing its decision
    Response,
}

/// Result announced by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderOutcome {
    Unknown,
    Success,
    Timeout,
}

/// Message of the leader-directed join-party protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPartyLeaderComm {
    pub session_id: String,
    pub msg_type: LeaderCommType,
    pub outcome: LeaderOutcome,
    pub participant_ids: Vec<PeerId>,
}

impl JoinPartyLeaderComm {
    pub fn request<S: Into<String>>(session_id: S) -> Self {
        Self {
            session_id: session_id.into(),
            msg_type: LeaderCommType::Request,
            outcome: LeaderOutcome::Unknown,
            participant_ids: Vec::new(),
        }
    }

    pub fn response<S: Into<String>>(session_id: S, decision: &LeaderDecision) -> Self {
        Self {
            session_id: session_id.into(),
            msg_type: LeaderCommType::Response,
            outcome: decision.outcome,
            participant_ids: decision.participants.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self).map_err(DecodeError::from)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes).map_err(DecodeError::from)?)
    }
}

/// Final outcome recorded for a leader-directed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderDecision {
    pub outcome: LeaderOutcome,
    pub participants: Vec<PeerId>,
}

impl LeaderDecision {
    pub fn new(outcome: LeaderOutcome, participants: Vec<PeerId>) -> Self {
        Self {
            outcome,
            participants,
        }
    }
}

// ----------------------------------------------------------------------------
// Acknowledgments
// ----------------------------------------------------------------------------

/// Short framed replies on join-party streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    RequestReceived,
    InvalidRequest,
    CopyDone,
}

impl Ack {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Ack::RequestReceived => "request received",
            Ack::InvalidRequest => "invalid request",
            Ack::CopyDone => "copy_done",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"request received" => Some(Ack::RequestReceived),
            b"invalid request" => Some(Ack::InvalidRequest),
            b"copy_done" => Some(Ack::CopyDone),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Signing Stream Messages
// ----------------------------------------------------------------------------

/// Kind of message carried on the signing stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TssMessageType {
    KeyGenMsg,
    KeySignMsg,
    KeyGenVerMsg,
    KeySignVerMsg,
    KeyGenSync,
    KeySignSync,
    Signature,
    Unknown,
}

impl fmt::Display for TssMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TssMessageType::KeyGenMsg => "TSSKeyGenMsg",
            TssMessageType::KeySignMsg => "TSSKeySignMsg",
            TssMessageType::KeyGenVerMsg => "TSSKeyGenVerMsg",
            TssMessageType::KeySignVerMsg => "TSSKeySignVerMsg",
            TssMessageType::KeyGenSync => "TSSKeyGenSync",
            TssMessageType::KeySignSync => "TSSKeySignSync",
            TssMessageType::Signature => "TSSSignature",
            TssMessageType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Typed envelope on the signing stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: TssMessageType,
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl WrappedMessage {
    pub fn new<S: Into<String>>(message_type: TssMessageType, session_id: S, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            session_id: session_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(DecodeError::from)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes).map_err(DecodeError::from)?)
    }
}

/// Signature outcome shared with signers that did not compute it
///
/// A missing signature is a failure notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSignature {
    /// Base64 message the signature covers
    pub message: String,
    pub signature: Option<Signature>,
}

impl SharedSignature {
    pub fn signed<S: Into<String>>(message: S, signature: Signature) -> Self {
        Self {
            message: message.into(),
            signature: Some(signature),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            signature: None,
        }
    }
}
