//! Tessera Runtime
//!
//! This crate runs the threshold-signature coordination protocols:
//! - `PartyCoordinator`: leader election and the two join-party protocols
//! - `SignatureRaceCoordinator`: local signing raced against shared signatures
//! - `MessageRouter`: signing and keygen message routing between peers
//! - Session and stream managers
//! - `TssNode`: the service tying them together
//!
//! `tessera-core` provides the types, messages and transport contract.

pub mod builder;
pub mod coordination;
pub mod managers;
pub mod messenger;
pub mod node;
pub mod notifier;
pub mod race;

pub use builder::TssNodeBuilder;
pub use coordination::{elect_leader, PartyCoordinator, PartyOutcome, JOIN_PARTY_RESERVATION};
pub use managers::*;
pub use messenger::{InboundMessage, MessageRouter};
pub use node::TssNode;
pub use notifier::BroadcastSignatureNotifier;
pub use race::{RaceChannel, RaceListener, RaceReport, RaceSignal, RaceState, SignatureRaceCoordinator};

// Re-export core types for convenience
pub use tessera_core::{
    KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, PeerId, TesseraConfig, TesseraError,
    TesseraResult,
};
