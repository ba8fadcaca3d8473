//! Tessera Protocol Module
//!
//! - `messages`: join-party messages, acknowledgments and signing stream envelopes
//! - `wire`: length-prefixed framing over async streams

pub mod messages;
pub mod wire;

pub use messages::{
    Ack, JoinPartyLeaderComm, JoinPartyRequest, LeaderCommType, LeaderDecision, LeaderOutcome,
    SharedSignature, TssMessageType, WrappedMessage,
};
pub use wire::{read_frame, write_frame, LENGTH_HEADER, MAX_PAYLOAD};
