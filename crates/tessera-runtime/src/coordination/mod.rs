//! Party formation: leader election and the join-party protocols

pub mod leader;
pub mod party;

pub use leader::{elect_leader, leader_score};
pub use party::{PartyCoordinator, PartyOutcome, JOIN_PARTY_RESERVATION};
